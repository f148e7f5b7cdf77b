//! Protocol Negotiation
//!
//! Walks an ordered candidate list, probing each transport with Mode 01
//! PID 00. The first transport that answers becomes the session transport.

use crate::engine::{exchange, open_channel, AttemptError};
use crate::error::{NegotiationAttempt, ObdError, ObdResult};
use obd_adapter::{ChannelHandle, DeviceAdapter, DeviceCapabilities};
use obd_protocol::{ParameterRequest, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Candidate order when none is configured
pub const DEFAULT_ORDER: [Transport; 2] = [Transport::Iso15765_4Can11bit500, Transport::Iso9141_2];

/// Legacy candidates tried after the default order
pub const LEGACY_ORDER: [Transport; 3] = [
    Transport::J1850Pwm,
    Transport::J1850Vpw,
    Transport::Iso14230_4KwpFast,
];

/// Negotiation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Explicit candidate order, replacing the defaults
    pub candidates: Option<Vec<Transport>>,
    /// Try J1850 PWM/VPW and KWP fast init after the defaults
    pub include_legacy: bool,
    /// Probe timeout; the transport default when unset
    pub probe_timeout_ms: Option<u64>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            candidates: None,
            include_legacy: true,
            probe_timeout_ms: None,
        }
    }
}

/// Observable negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    Probing(Transport),
    Selected(Transport),
    Failed,
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub transport: Transport,
    /// Channel left open on the selected transport
    pub handle: ChannelHandle,
}

pub struct Negotiator {
    config: NegotiatorConfig,
    state: NegotiationState,
    attempts: Vec<NegotiationAttempt>,
}

impl Negotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self {
            config,
            state: NegotiationState::Idle,
            attempts: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn selected(&self) -> Option<Transport> {
        match self.state {
            NegotiationState::Selected(transport) => Some(transport),
            _ => None,
        }
    }

    /// Failures recorded by the last negotiation
    pub fn attempts(&self) -> &[NegotiationAttempt] {
        &self.attempts
    }

    /// Forget the selection
    pub fn reset(&mut self) {
        self.state = NegotiationState::Idle;
        self.attempts.clear();
    }

    /// Candidates in probe order, restricted to what the device supports
    pub fn candidates(&self, capabilities: &DeviceCapabilities) -> Vec<Transport> {
        let ordered: Vec<Transport> = match &self.config.candidates {
            Some(list) => list.clone(),
            None if self.config.include_legacy => {
                DEFAULT_ORDER.iter().chain(LEGACY_ORDER.iter()).copied().collect()
            }
            None => DEFAULT_ORDER.to_vec(),
        };
        ordered
            .into_iter()
            .filter(|transport| {
                let supported = capabilities.supports(*transport);
                if !supported {
                    debug!("Skipping {}: not supported by {}", transport, capabilities.kind);
                }
                supported
            })
            .collect()
    }

    /// Probe candidates in order. On success the winning channel stays
    /// open; on failure no channel is left open.
    pub async fn negotiate(
        &mut self,
        adapter: &dyn DeviceAdapter,
        capabilities: &DeviceCapabilities,
    ) -> ObdResult<Negotiated> {
        self.attempts.clear();
        let candidates = self.candidates(capabilities);
        info!("Negotiating transport over {} candidates", candidates.len());

        for transport in candidates {
            self.state = NegotiationState::Probing(transport);
            match self.probe(adapter, transport).await {
                Ok(handle) => {
                    info!("Selected transport {}", transport);
                    self.state = NegotiationState::Selected(transport);
                    return Ok(Negotiated { transport, handle });
                }
                Err(ObdError::Adapter(e)) if e.is_fatal() => {
                    self.state = NegotiationState::Failed;
                    return Err(ObdError::Adapter(e));
                }
                Err(e) => {
                    debug!("Probe on {} failed: {}", transport, e);
                    self.attempts.push(NegotiationAttempt {
                        transport,
                        error: e.to_string(),
                    });
                }
            }
        }

        warn!("No transport answered the probe");
        self.state = NegotiationState::Failed;
        Err(ObdError::NegotiationFailed {
            attempts: self.attempts.clone(),
        })
    }

    async fn probe(&self, adapter: &dyn DeviceAdapter, transport: Transport) -> ObdResult<ChannelHandle> {
        let request = ParameterRequest::current(0x00);
        let handle = open_channel(adapter, transport)
            .await
            .map_err(|e| AttemptError::Adapter(e).into_obd(transport, &request))?;

        let timeout = self
            .config
            .probe_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| transport.default_timeout());
        let result = exchange(adapter, transport, handle, &request, timeout, 4)
            .await
            .map_err(|e| e.into_obd(transport, &request))
            .and_then(|response| {
                if response.payload.len() == 4 {
                    Ok(response)
                } else {
                    Err(ObdError::InvalidRequest(format!(
                        "probe answer carries {} bitmap bytes",
                        response.payload.len()
                    )))
                }
            });

        match result {
            Ok(_) => Ok(handle),
            Err(e) => {
                if let Err(close_err) = adapter.disconnect(handle).await {
                    debug!("Closing {} after failed probe: {}", handle, close_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_adapter::{AdapterConfig, AdapterError, Simulator, SimulatorConfig};

    async fn ready(transports: Vec<Transport>) -> (Simulator, DeviceCapabilities) {
        let sim = Simulator::new(SimulatorConfig {
            transports,
            ..Default::default()
        });
        let capabilities = sim.initialize(&AdapterConfig::default()).await.unwrap();
        (sim, capabilities)
    }

    #[tokio::test]
    async fn test_default_order() {
        let (_sim, capabilities) = ready(vec![]).await;
        let negotiator = Negotiator::new(NegotiatorConfig::default());
        assert_eq!(
            negotiator.candidates(&capabilities),
            vec![
                Transport::Iso15765_4Can11bit500,
                Transport::Iso9141_2,
                Transport::J1850Pwm,
                Transport::J1850Vpw,
                Transport::Iso14230_4KwpFast,
            ]
        );

        let negotiator = Negotiator::new(NegotiatorConfig {
            include_legacy: false,
            ..Default::default()
        });
        assert_eq!(negotiator.candidates(&capabilities).len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_candidates_skipped() {
        let (_sim, mut capabilities) = ready(vec![]).await;
        capabilities.transports = vec![Transport::Iso9141_2, Transport::J1850Vpw];
        let negotiator = Negotiator::new(NegotiatorConfig::default());
        assert_eq!(
            negotiator.candidates(&capabilities),
            vec![Transport::Iso9141_2, Transport::J1850Vpw]
        );
    }

    #[tokio::test]
    async fn test_selects_can_first() {
        let (sim, capabilities) = ready(vec![Transport::Iso15765_4Can11bit500]).await;
        let mut negotiator = Negotiator::new(NegotiatorConfig::default());

        let negotiated = negotiator.negotiate(&sim, &capabilities).await.unwrap();
        assert_eq!(negotiated.transport, Transport::Iso15765_4Can11bit500);
        assert_eq!(
            negotiator.state(),
            NegotiationState::Selected(Transport::Iso15765_4Can11bit500)
        );
        assert!(sim.is_channel_open(negotiated.handle));
        assert!(negotiator.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_iso9141() {
        let (sim, capabilities) = ready(vec![Transport::Iso9141_2]).await;
        let mut negotiator = Negotiator::new(NegotiatorConfig::default());

        let negotiated = negotiator.negotiate(&sim, &capabilities).await.unwrap();
        assert_eq!(negotiated.transport, Transport::Iso9141_2);
        assert_eq!(negotiator.selected(), Some(Transport::Iso9141_2));
        assert_eq!(negotiator.attempts().len(), 1);
        assert_eq!(
            negotiator.attempts()[0].transport,
            Transport::Iso15765_4Can11bit500
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_fail() {
        let (sim, capabilities) = ready(vec![]).await;
        let mut negotiator = Negotiator::new(NegotiatorConfig::default());

        match negotiator.negotiate(&sim, &capabilities).await {
            Err(ObdError::NegotiationFailed { attempts }) => {
                let tried: Vec<Transport> = attempts.iter().map(|a| a.transport).collect();
                assert_eq!(tried, negotiator.candidates(&capabilities));
            }
            other => panic!("expected NegotiationFailed, got {:?}", other),
        }
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(negotiator.selected(), None);
        assert!(sim.read_status().await.unwrap().active_transport.is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let sim = Simulator::new(SimulatorConfig::default());
        let capabilities = DeviceCapabilities {
            kind: obd_adapter::DeviceKind::Simulator,
            transports: Transport::ALL.to_vec(),
            max_sample_rate_hz: 10,
            multi_bus: false,
            safety_limits: None,
            firmware_version: None,
            supports_tuning: false,
        };
        let mut negotiator = Negotiator::new(NegotiatorConfig::default());

        // Never initialized
        let err = negotiator.negotiate(&sim, &capabilities).await.unwrap_err();
        assert_eq!(err, ObdError::Adapter(AdapterError::NotInitialized));
        assert!(negotiator.attempts().is_empty());
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }
}
