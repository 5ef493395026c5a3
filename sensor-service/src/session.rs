//! Per-client view of the broker
//!
//! [`ServiceClient`] is the control surface a client-side proxy talks to.
//! [`BrokerSession`] implements it in-process by binding a
//! [`ClientRegistration`] to every call.

use sensor_channel::SendEndpoint;
use sensor_hal::{SensorDescriptor, SensorIdentity};

use crate::broker::Broker;
use crate::client::ClientRegistration;
use crate::error::Result;

/// Control calls a client process can make on the broker
pub trait ServiceClient: Send + Sync {
    fn sensor_list(&self) -> Result<Vec<SensorDescriptor>>;

    /// Hand the send end of a freshly created data channel to the broker
    fn transfer_data_channel(&self, endpoint: SendEndpoint) -> Result<()>;

    fn destroy_data_channel(&self) -> Result<()>;

    fn enable_sensor(&self, sensor: SensorIdentity, period_ns: i64, delay_ns: i64) -> Result<()>;

    fn disable_sensor(&self, sensor: SensorIdentity) -> Result<()>;

    fn set_mode(&self, sensor: SensorIdentity, mode: i32) -> Result<()>;

    fn set_option(&self, sensor: SensorIdentity, option: i32) -> Result<()>;
}

/// A client's session on an in-process [`Broker`]
#[derive(Debug, Clone)]
pub struct BrokerSession {
    broker: Broker,
    registration: ClientRegistration,
}

impl BrokerSession {
    pub fn new(broker: Broker, registration: ClientRegistration) -> Self {
        Self { broker, registration }
    }

    pub fn registration(&self) -> &ClientRegistration {
        &self.registration
    }

    pub fn pid(&self) -> i32 {
        self.registration.pid
    }
}

impl ServiceClient for BrokerSession {
    fn sensor_list(&self) -> Result<Vec<SensorDescriptor>> {
        Ok(self.broker.sensor_list())
    }

    fn transfer_data_channel(&self, endpoint: SendEndpoint) -> Result<()> {
        self.broker
            .transfer_data_channel(self.registration.clone(), endpoint)
    }

    fn destroy_data_channel(&self) -> Result<()> {
        self.broker.destroy_sensor_channel(self.pid())
    }

    fn enable_sensor(&self, sensor: SensorIdentity, period_ns: i64, delay_ns: i64) -> Result<()> {
        self.broker.enable_sensor(self.pid(), sensor, period_ns, delay_ns)
    }

    fn disable_sensor(&self, sensor: SensorIdentity) -> Result<()> {
        self.broker.disable_sensor(self.pid(), sensor)
    }

    fn set_mode(&self, sensor: SensorIdentity, mode: i32) -> Result<()> {
        self.broker.set_mode(self.pid(), sensor, mode)
    }

    fn set_option(&self, sensor: SensorIdentity, option: i32) -> Result<()> {
        self.broker.set_option(sensor, option)
    }
}

impl Broker {
    /// Open a session for the client described by `registration`
    pub fn session(&self, registration: ClientRegistration) -> BrokerSession {
        BrokerSession::new(self.clone(), registration)
    }
}
