//! Config and status operations shared by the HTTP API and the CLI

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uwb_link::{Correlator, LinkHandle, LinkSnapshot, ReplyTiming, Telemetry};
use uwb_proto::{Opcode, TlvFrame};

use crate::anchor_config::{AnchorConfig, OtherRecord};

/// Result of a GET
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReadout {
    pub request_id: u16,
    pub status: u8,
    pub applied: u8,
    pub config: AnchorConfig,
    pub other: Vec<OtherRecord>,
    pub truncated: bool,
}

/// Result of a SET
#[derive(Debug, Clone, Serialize)]
pub struct SetOutcome {
    pub ok: bool,
    pub request_id: u16,
    pub status: u8,
    pub applied: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub link: LinkSnapshot,
    pub telemetry: Telemetry,
}

#[derive(Clone)]
pub struct Bridge {
    correlator: Arc<Correlator>,
    timing: ReplyTiming,
}

impl Bridge {
    pub fn new(correlator: Arc<Correlator>, timing: ReplyTiming) -> Self {
        Self { correlator, timing }
    }

    pub fn link(&self) -> &LinkHandle {
        self.correlator.link()
    }

    pub async fn get_config(&self) -> Result<ConfigReadout, uwb_link::Error> {
        let reply = self
            .correlator
            .request(Opcode::Get, TlvFrame::new(), self.timing)
            .await?;
        let (config, other) = AnchorConfig::from_tlv(&reply.records);
        Ok(ConfigReadout {
            request_id: reply.ack.request_id,
            status: reply.ack.status,
            applied: reply.ack.applied_count,
            config,
            other,
            truncated: reply.truncated,
        })
    }

    pub async fn set_config(&self, config: &AnchorConfig) -> Result<SetOutcome, uwb_link::Error> {
        let payload = config.to_tlv();
        info!(target: "CFG", fields = payload.len(), "SET {payload}");
        let reply = self.correlator.request(Opcode::Set, payload, self.timing).await?;
        Ok(SetOutcome {
            ok: reply.ack.status == 0,
            request_id: reply.ack.request_id,
            status: reply.ack.status,
            applied: reply.ack.applied_count,
        })
    }

    pub fn status(&self) -> StatusReport {
        let link = self.link();
        StatusReport {
            link: link.snapshot(),
            telemetry: link.telemetry(),
        }
    }
}
