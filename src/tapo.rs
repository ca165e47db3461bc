//! Tapo smart plug client
//!
//! Production implementation of the outlet device traits over the `tapo`
//! crate. Device quirks are fixed per plug model; only P110-class plugs are
//! supported.

use crate::config::{OutletConfig, TapoAuthConfig};
use crate::error::Result;
use crate::outlet::{OutletConnector, OutletDevice};
use async_trait::async_trait;
use tapo::ApiClient;

/// Connection factory for one plug
pub struct TapoConnector {
    host: String,
    username: String,
    password: String,
}

impl TapoConnector {
    pub fn new(auth: &TapoAuthConfig, outlet: &OutletConfig) -> Self {
        Self {
            host: outlet.host.clone(),
            username: auth.username.clone(),
            password: auth.password.clone(),
        }
    }
}

#[async_trait]
impl OutletConnector for TapoConnector {
    async fn connect(&self) -> Result<Box<dyn OutletDevice>> {
        let client = ApiClient::new(&self.username, &self.password);
        let handler = client.p110(&self.host).await?;
        Ok(Box::new(TapoPlug { handler }))
    }
}

/// A connected P110 plug
pub struct TapoPlug {
    handler: tapo::PlugEnergyMonitoringHandler,
}

#[async_trait]
impl OutletDevice for TapoPlug {
    async fn refresh(&mut self) -> Result<bool> {
        let info = self.handler.get_device_info().await?;
        Ok(info.device_on)
    }

    async fn switch(&mut self, on: bool) -> Result<()> {
        if on {
            self.handler.on().await?;
        } else {
            self.handler.off().await?;
        }
        Ok(())
    }
}
