pub mod bridge;
pub mod message;

/// Identifies one controllable actuator on a GARDENA smart gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub tenant: String,
    pub gateway_id: String,
    pub device_id: String,
    pub actuator_index: u32,
}

impl DeviceAddress {
    pub fn new(
        tenant: impl Into<String>,
        gateway_id: impl Into<String>,
        device_id: impl Into<String>,
        actuator_index: u32,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            gateway_id: gateway_id.into(),
            device_id: device_id.into(),
            actuator_index,
        }
    }

    /// Wildcard filter covering every state sub-path of the device.
    pub fn state_topic(&self) -> String {
        state_topic(&self.tenant, &self.gateway_id, &self.device_id)
    }

    pub fn command_topic(&self) -> String {
        command_topic(
            &self.tenant,
            &self.gateway_id,
            &self.device_id,
            self.actuator_index,
        )
    }
}

pub fn state_topic(tenant: &str, gateway_id: &str, device_id: &str) -> String {
    format!("{tenant}/sta/{gateway_id}/{device_id}/#")
}

pub fn command_topic(tenant: &str, gateway_id: &str, device_id: &str, index: u32) -> String {
    format!("{tenant}/exc/{gateway_id}/{device_id}/actuator/{index}/start")
}

/// Topic the gateway answers a command on.
pub fn response_topic(tenant: &str, response_client_id: &str, session_id: &str) -> String {
    format!("{tenant}/exc-res/{response_client_id}/{session_id}")
}
