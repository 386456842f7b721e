//! The simulated SailBot.
//!
//! Position is kept in the local cartesian frame of [`Projection`] and the geographic position is
//! derived from it whenever it changes. The wind angle is always derived from the heading.
use bytes::Bytes;
use std::fmt;

use crate::geo::Projection;
use crate::protocol::{
    Address, ApplicationType, Frame, FrameCodec, Header, Payload, ProtocolError, SailBotData,
    GATEWAY_ADDRESS_DEFAULT, PROTOCOL_VERSION, SWARM_ID_DEFAULT,
};

/// Direction of the wind in the global frame [deg].
pub const TRUE_WIND_ANGLE: u16 = 30;

/// Heading change per tick of [`SliderModel`] [deg].
pub const HEADING_STEP: u16 = 10;

pub const START_LATITUDE: f64 = 48.832313;
pub const START_LONGITUDE: f64 = 2.412689;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Driven by the rudder and sail sliders of the controlling application.
    #[default]
    Manual,
    /// Reserved for onboard navigation. The bot holds its state.
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlInputs {
    pub rudder: i8,
    pub sail: i8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    /// [m]
    pub x: f64,
    /// [m]
    pub y: f64,
    /// [deg], 0 to 359.
    pub heading: u16,
}

/// Advances the kinematic state by one tick.
pub trait MotionModel: fmt::Debug + Send {
    fn advance(&self, kinematics: &mut Kinematics, inputs: ControlInputs);
}

/// Placeholder model: the slider values are used directly as position deltas and the bot turns
/// by a fixed step every tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct SliderModel;

impl MotionModel for SliderModel {
    fn advance(&self, k: &mut Kinematics, inputs: ControlInputs) {
        k.x += f64::from(inputs.rudder);
        k.y += f64::from(inputs.sail);
        k.heading = (k.heading + HEADING_STEP) % 360;
    }
}

/// Copy of the observable state of a bot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SailBotState {
    pub address: Address,
    pub latitude: f64,
    pub longitude: f64,
    pub x: f64,
    pub y: f64,
    pub heading: u16,
    pub wind_angle: u16,
    pub rudder: i8,
    pub sail: i8,
    pub mode: ControlMode,
}

#[derive(Debug)]
pub struct SailBot {
    address: Address,
    gateway: Address,
    swarm_id: u16,

    projection: Projection,
    latitude: f64,
    longitude: f64,
    kinematics: Kinematics,
    true_wind_angle: u16,

    inputs: ControlInputs,
    mode: ControlMode,
    motion: Box<dyn MotionModel>,
}

impl SailBot {
    pub fn new(address: Address) -> SailBot {
        let projection = Projection::default();
        let (x, y) = projection.to_cartesian(START_LATITUDE, START_LONGITUDE);

        SailBot {
            address,
            gateway: GATEWAY_ADDRESS_DEFAULT,
            swarm_id: SWARM_ID_DEFAULT,
            projection,
            latitude: START_LATITUDE,
            longitude: START_LONGITUDE,
            kinematics: Kinematics { x, y, heading: 0 },
            true_wind_angle: TRUE_WIND_ANGLE,
            inputs: ControlInputs::default(),
            mode: ControlMode::Manual,
            motion: Box::new(SliderModel),
        }
    }

    /// Place the bot at a geographic position.
    pub fn with_position(mut self, latitude: f64, longitude: f64) -> SailBot {
        let (x, y) = self.projection.to_cartesian(latitude, longitude);
        self.kinematics.x = x;
        self.kinematics.y = y;
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    pub fn with_heading(mut self, heading: u16) -> SailBot {
        self.kinematics.heading = heading % 360;
        self
    }

    pub fn with_link(mut self, gateway: Address, swarm_id: u16) -> SailBot {
        self.gateway = gateway;
        self.swarm_id = swarm_id;
        self
    }

    pub fn with_motion_model(mut self, motion: impl MotionModel + 'static) -> SailBot {
        self.motion = Box::new(motion);
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn wind_angle(&self) -> u16 {
        (i32::from(self.true_wind_angle) - i32::from(self.kinematics.heading)).rem_euclid(360)
            as u16
    }

    pub fn state(&self) -> SailBotState {
        SailBotState {
            address: self.address,
            latitude: self.latitude,
            longitude: self.longitude,
            x: self.kinematics.x,
            y: self.kinematics.y,
            heading: self.kinematics.heading,
            wind_angle: self.wind_angle(),
            rudder: self.inputs.rudder,
            sail: self.inputs.sail,
            mode: self.mode,
        }
    }

    /// One simulated hardware interrupt.
    pub fn tick(&mut self) {
        match self.mode {
            ControlMode::Manual => {
                self.motion.advance(&mut self.kinematics, self.inputs);
                self.kinematics.heading %= 360;

                let (latitude, longitude) = self
                    .projection
                    .to_geographic(self.kinematics.x, self.kinematics.y);
                self.latitude = latitude;
                self.longitude = longitude;
            }
            ControlMode::Automatic => {}
        }
    }

    fn header(&self) -> Header {
        Header {
            destination: self.gateway,
            source: self.address,
            swarm_id: self.swarm_id,
            application: ApplicationType::SailBot,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn telemetry(&self) -> Frame {
        Frame {
            header: self.header(),
            payload: Payload::SailBotData(SailBotData {
                heading: self.kinematics.heading,
                latitude: (self.latitude * 1.0e6) as i32,
                longitude: (self.longitude * 1.0e6) as i32,
                wind_angle: self.wind_angle(),
            }),
        }
    }

    pub fn encode_telemetry<C: FrameCodec + ?Sized>(&self, codec: &C) -> Bytes {
        codec.encode(&self.telemetry())
    }

    /// Announces the bot to the gateway, sent once before the first tick.
    pub fn advertise<C: FrameCodec + ?Sized>(&self, codec: &C) -> Bytes {
        codec.encode(&Frame {
            header: self.header(),
            payload: Payload::Advertisement,
        })
    }

    /// Decode a framed command and apply it if it is addressed to this bot.
    pub fn decode_command<C: FrameCodec + ?Sized>(
        &mut self,
        codec: &C,
        framed: &[u8],
    ) -> Result<bool, ProtocolError> {
        let frame = codec.decode(framed)?;
        Ok(self.handle_frame(&frame))
    }

    /// Apply a decoded frame. Returns `true` if the frame was a command for this bot.
    pub fn handle_frame(&mut self, frame: &Frame) -> bool {
        if frame.header.destination != self.address {
            return false;
        }

        match frame.payload {
            Payload::MoveRaw(m) => {
                self.mode = ControlMode::Manual;
                self.inputs = ControlInputs {
                    rudder: to_signed(m.left_x),
                    sail: to_signed(m.right_y),
                };
                trace!(
                    "{}: rudder: {}, sail: {}",
                    self.address,
                    self.inputs.rudder,
                    self.inputs.sail
                );
                true
            }
            payload => {
                trace!(
                    "{}: ignoring {:?} payload",
                    self.address,
                    payload.payload_type()
                );
                false
            }
        }
    }
}

/// Reinterpret a slider byte as two's complement: values above 127 are `v - 256`.
fn to_signed(v: u8) -> i8 {
    v as i8
}
