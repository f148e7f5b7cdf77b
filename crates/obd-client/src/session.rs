//! OBD Client Session
//!
//! One `ObdClient` owns one adapter for its lifetime: the negotiated
//! transport, the request engine, the safety validator and at most one
//! running monitor. Nothing here is global.

use crate::decoder::DiagnosticDecoder;
use crate::engine::{ChannelCloser, EngineConfig, RequestEngine, RequestStatistics};
use crate::error::{ObdError, ObdResult};
use crate::negotiator::{NegotiationState, Negotiator, NegotiatorConfig};
use async_trait::async_trait;
use obd_adapter::{
    AdapterConfig, AdapterFactory, DeviceAdapter, DeviceCapabilities, DeviceStatus,
};
use obd_protocol::{DtcEntry, FreezeFrame, Pid, PidValue, Transport};
use obd_scheduler::{
    start_monitor, MonitorConfig, MonitorHandle, MonitorSample, PidSource, SafetyBinding,
    SourceError,
};
use safety_validator::{ControlCommand, SafetyLimits, SafetyMonitor, Validator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Full session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub adapter: AdapterConfig,
    pub negotiator: NegotiatorConfig,
    pub engine: EngineConfig,
    pub monitor: MonitorConfig,
    pub safety_limits: SafetyLimits,
    /// Limit name -> live PID watched for that limit while monitoring
    pub limit_pids: BTreeMap<String, u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            negotiator: NegotiatorConfig::default(),
            engine: EngineConfig::default(),
            monitor: MonitorConfig::default(),
            safety_limits: SafetyLimits::default(),
            limit_pids: BTreeMap::from([
                ("max_rpm".to_string(), Pid::Rpm.as_hex()),
                ("max_coolant_temp".to_string(), Pid::CoolantTemp.as_hex()),
            ]),
        }
    }
}

/// Monitor feed backed by the session engine
struct EngineSource {
    engine: Arc<Mutex<RequestEngine>>,
}

#[async_trait]
impl PidSource for EngineSource {
    async fn sample(&self, pid: u8) -> Result<PidValue, SourceError> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine)
            .query(pid)
            .await
            .map_err(SourceError::from)
    }
}

pub struct ObdClient {
    adapter: Arc<dyn DeviceAdapter>,
    capabilities: DeviceCapabilities,
    config: ClientConfig,
    negotiator: Negotiator,
    engine: Arc<Mutex<RequestEngine>>,
    closer: ChannelCloser,
    validator: Validator,
    monitor: Option<MonitorHandle>,
}

impl ObdClient {
    /// Build the adapter through `factory`, then open it
    pub async fn connect(factory: &dyn AdapterFactory, config: ClientConfig) -> ObdResult<Self> {
        info!("Creating OBD client for device: {}", config.adapter.kind);
        let adapter = factory.create(&config.adapter)?;
        Self::open(adapter, config).await
    }

    /// Validate limits and initialize the adapter. Limits the device
    /// reports about itself can only tighten the configured ones.
    pub async fn open(adapter: Arc<dyn DeviceAdapter>, config: ClientConfig) -> ObdResult<Self> {
        let mut validator = Validator::new(config.safety_limits.clone())?;
        let capabilities = adapter.initialize(&config.adapter).await?;
        info!(
            "{} ready: {} transports, tuning {}",
            capabilities.kind,
            capabilities.transports.len(),
            if capabilities.supports_tuning { "enabled" } else { "disabled" }
        );

        if let Some(device_limits) = &capabilities.safety_limits {
            let merged = config.safety_limits.tightened_by(device_limits);
            if &merged != validator.limits() {
                info!("Applying tighter limits reported by {}", capabilities.kind);
            }
            validator.reconfigure(merged)?;
        }

        let engine = RequestEngine::new(adapter.clone(), config.engine.clone());
        Ok(Self {
            negotiator: Negotiator::new(config.negotiator.clone()),
            closer: engine.closer(),
            engine: Arc::new(Mutex::new(engine)),
            adapter,
            capabilities,
            config,
            validator,
            monitor: None,
        })
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    /// Negotiate a transport, or return the one already selected
    pub async fn negotiate(&mut self) -> ObdResult<Transport> {
        let mut engine = self.engine.lock().await;
        if let Some(transport) = engine.transport() {
            return Ok(transport);
        }
        let negotiated = self
            .negotiator
            .negotiate(self.adapter.as_ref(), &self.capabilities)
            .await?;
        engine.attach(negotiated.transport, negotiated.handle);
        Ok(negotiated.transport)
    }

    /// Drop the current transport and negotiate again. A running monitor
    /// is stopped first.
    pub async fn renegotiate(&mut self) -> ObdResult<Transport> {
        self.stop_monitoring().await;
        {
            let mut engine = self.engine.lock().await;
            if let Some(handle) = engine.handle() {
                info!("Renegotiating, closing {}", handle);
                if let Err(e) = self.adapter.disconnect(handle).await {
                    debug!("Closing {} before renegotiation: {}", handle, e);
                }
            }
            engine.detach();
        }
        self.negotiator.reset();
        self.negotiate().await
    }

    pub async fn active_transport(&self) -> Option<Transport> {
        self.engine.lock().await.transport()
    }

    /// Current value of one Mode 01 PID
    pub async fn query(&self, pid: u8) -> ObdResult<PidValue> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).query(pid).await
    }

    /// Supported PIDs for Mode 01 or Mode 02
    pub async fn supported_pids(&self, service: u8) -> ObdResult<Vec<u8>> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).supported_pids(service).await
    }

    /// Stored trouble codes (Mode 03) with their status
    pub async fn read_dtcs(&self) -> ObdResult<Vec<DtcEntry>> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).read_dtcs().await
    }

    /// Pending trouble codes (Mode 07)
    pub async fn read_pending_dtcs(&self) -> ObdResult<Vec<DtcEntry>> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).read_pending_dtcs().await
    }

    pub async fn read_freeze_frame(&self, dtc: &str) -> ObdResult<Vec<FreezeFrame>> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).read_freeze_frame(dtc).await
    }

    /// Clear trouble codes. `Ok(false)` when the vehicle refused.
    pub async fn clear_dtcs(&self) -> ObdResult<bool> {
        let mut engine = self.engine.lock().await;
        DiagnosticDecoder::new(&mut engine).clear_dtcs().await
    }

    /// Validate a control command, then forward it to the device
    pub async fn write_command(&self, command: &ControlCommand) -> ObdResult<()> {
        self.validator.validate(command)?;
        let handle = self
            .engine
            .lock()
            .await
            .handle()
            .ok_or(ObdError::NotNegotiated)?;
        self.adapter.write_parameter(handle, command).await?;
        info!("Wrote {} = {}", command.parameter, command.value);
        Ok(())
    }

    /// Replace the configured limits. Device limits still apply on top.
    pub fn reconfigure_safety(&mut self, limits: SafetyLimits) -> ObdResult<()> {
        limits.validate()?;
        let effective = match &self.capabilities.safety_limits {
            Some(device_limits) => limits.tightened_by(device_limits),
            None => limits.clone(),
        };
        self.validator.reconfigure(effective)?;
        self.config.safety_limits = limits;
        info!("Safety limits reconfigured ({} limits)", self.validator.limits().len());
        Ok(())
    }

    /// Limits in force
    pub fn safety_limits(&self) -> &SafetyLimits {
        self.validator.limits()
    }

    pub async fn read_voltage(&self) -> ObdResult<f64> {
        Ok(self.adapter.read_voltage().await?)
    }

    pub async fn device_status(&self) -> ObdResult<DeviceStatus> {
        Ok(self.adapter.read_status().await?)
    }

    /// Start periodic sampling of `pids`, replacing any running monitor
    pub async fn start_monitoring(&mut self, pids: &[u8], interval: Duration) -> ObdResult<()> {
        if self.engine.lock().await.transport().is_none() {
            return Err(ObdError::NotNegotiated);
        }
        self.stop_monitoring().await;

        let config = MonitorConfig {
            interval_ms: interval.as_millis() as u64,
            ..self.config.monitor.clone()
        };
        let source = Arc::new(EngineSource {
            engine: self.engine.clone(),
        });
        let handle = start_monitor(source, pids.to_vec(), config, self.safety_binding(pids))?;
        self.monitor = Some(handle);
        Ok(())
    }

    fn safety_binding(&self, pids: &[u8]) -> Option<SafetyBinding> {
        let limits: BTreeMap<u8, String> = self
            .config
            .limit_pids
            .iter()
            .filter(|(name, pid)| {
                pids.contains(pid) && self.validator.limits().get(name.as_str()).is_some()
            })
            .map(|(name, &pid)| (pid, name.clone()))
            .collect();
        if limits.is_empty() {
            return None;
        }
        debug!("Watching {} safety limits while monitoring", limits.len());
        Some(SafetyBinding {
            monitor: SafetyMonitor::new(self.validator.limits().clone()),
            limits,
        })
    }

    pub async fn stop_monitoring(&mut self) {
        if let Some(mut handle) = self.monitor.take() {
            handle.stop().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().is_some_and(MonitorHandle::is_running)
    }

    pub fn latest_sample(&self) -> Option<MonitorSample> {
        self.monitor.as_ref().and_then(MonitorHandle::latest)
    }

    /// Up to `count` most recent samples, newest first
    pub fn monitor_history(&self, count: usize) -> Vec<MonitorSample> {
        self.monitor
            .as_ref()
            .map(|m| m.history(count))
            .unwrap_or_default()
    }

    /// Consecutive failures per monitored PID
    pub fn monitor_failures(&self) -> BTreeMap<u8, u32> {
        self.monitor
            .as_ref()
            .map(MonitorHandle::failure_counts)
            .unwrap_or_default()
    }

    pub async fn needs_renegotiation(&self) -> bool {
        self.engine.lock().await.needs_renegotiation()
    }

    pub async fn statistics(&self) -> RequestStatistics {
        self.engine.lock().await.statistics().clone()
    }

    /// Closer for whichever channel the session holds. Usable while a
    /// request is in flight, which then fails with a cancelled transport
    /// error.
    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }

    /// Stop monitoring, close the channel and release the device
    pub async fn close(mut self) -> ObdResult<()> {
        self.stop_monitoring().await;
        let handle = {
            let mut engine = self.engine.lock().await;
            let handle = engine.handle();
            engine.detach();
            handle
        };
        if let Some(handle) = handle {
            if let Err(e) = self.adapter.disconnect(handle).await {
                warn!("Closing {}: {}", handle, e);
            }
        }
        self.adapter.shutdown().await?;
        info!("OBD client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_adapter::{AdapterError, Simulator, SimulatorConfig};
    use safety_validator::{SafetyError, Threshold};

    async fn client(config: SimulatorConfig) -> (Simulator, ObdClient) {
        let sim = Simulator::new(config);
        let client = ObdClient::open(Arc::new(sim.clone()), ClientConfig::default())
            .await
            .unwrap();
        (sim, client)
    }

    #[tokio::test]
    async fn test_requests_need_negotiation() {
        let (_sim, client) = client(SimulatorConfig::default()).await;
        assert_eq!(client.query(0x0C).await.unwrap_err(), ObdError::NotNegotiated);
        assert_eq!(
            client
                .write_command(&ControlCommand::new("max_boost", 20.0))
                .await
                .unwrap_err(),
            ObdError::NotNegotiated
        );
    }

    #[tokio::test]
    async fn test_negotiation_is_cached() {
        let (sim, mut client) = client(SimulatorConfig::default()).await;
        assert_eq!(client.negotiate().await.unwrap(), Transport::Iso15765_4Can11bit500);
        let sent = sim.sent_frames().len();
        assert_eq!(client.negotiate().await.unwrap(), Transport::Iso15765_4Can11bit500);
        assert_eq!(sim.sent_frames().len(), sent);
        assert_eq!(
            client.negotiation_state(),
            NegotiationState::Selected(Transport::Iso15765_4Can11bit500)
        );
    }

    #[tokio::test]
    async fn test_renegotiate_probes_again() {
        let (sim, mut client) = client(SimulatorConfig::default()).await;
        client.negotiate().await.unwrap();
        let sent = sim.sent_frames().len();
        assert_eq!(client.renegotiate().await.unwrap(), Transport::Iso15765_4Can11bit500);
        assert!(sim.sent_frames().len() > sent);
        assert_eq!(client.query(0x0C).await.unwrap().value, 1726.0);
    }

    #[tokio::test]
    async fn test_invalid_limits_prevent_startup() {
        let sim = Simulator::new(SimulatorConfig::default());
        let config = ClientConfig {
            safety_limits: SafetyLimits::empty().with("max_boost", Threshold::upper(30.0, 32.0)),
            ..Default::default()
        };
        let result = ObdClient::open(Arc::new(sim), config).await;
        assert!(matches!(result, Err(ObdError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_device_limits_only_tighten() {
        let device = SafetyLimits::empty()
            .with("max_boost", Threshold::upper(22.0, 18.0))
            .with("max_egt", Threshold::upper(1200.0, 1100.0))
            .with("max_timing", Threshold::upper(40.0, 35.0));
        let (_sim, client) = client(SimulatorConfig {
            safety_limits: Some(device),
            ..Default::default()
        })
        .await;

        let limits = client.safety_limits();
        assert_eq!(limits.get("max_boost"), Some(&Threshold::upper(22.0, 18.0)));
        assert_eq!(limits.get("max_egt"), Some(&Threshold::upper(900.0, 850.0)));
        assert!(limits.get("max_timing").is_none());
    }

    #[tokio::test]
    async fn test_write_command_validated_before_device() {
        let (sim, mut client) = client(SimulatorConfig::default()).await;
        client.negotiate().await.unwrap();

        let err = client
            .write_command(&ControlCommand::new("max_boost", 35.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Safety(SafetyError::OutOfSafeRange { .. })));

        let err = client
            .write_command(&ControlCommand::new("ignition_advance", 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Safety(_)));
        assert!(sim.written_parameters().is_empty());

        client
            .write_command(&ControlCommand::new("max_boost", 25.0))
            .await
            .unwrap();
        assert_eq!(sim.written_parameters(), vec![ControlCommand::new("max_boost", 25.0)]);
    }

    #[tokio::test]
    async fn test_write_unsupported_without_tuning() {
        let (_sim, mut client) = client(SimulatorConfig {
            supports_tuning: false,
            ..Default::default()
        })
        .await;
        client.negotiate().await.unwrap();
        let err = client
            .write_command(&ControlCommand::new("max_boost", 25.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Adapter(AdapterError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_reconfigure_safety() {
        let (_sim, mut client) = client(SimulatorConfig::default()).await;
        let bad = SafetyLimits::empty().with("max_boost", Threshold::upper(20.0, 20.0));
        assert!(client.reconfigure_safety(bad).is_err());
        assert_eq!(client.safety_limits(), &SafetyLimits::default());

        let good = SafetyLimits::empty().with("max_boost", Threshold::upper(20.0, 15.0));
        client.reconfigure_safety(good.clone()).unwrap();
        assert_eq!(client.safety_limits(), &good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_watches_rpm_limit() {
        let mut sim_config = SimulatorConfig::default();
        // 7500 rpm
        sim_config.pids.insert(0x0C, vec![0x75, 0x30]);
        let (_sim, mut client) = client(sim_config).await;
        assert_eq!(
            client
                .start_monitoring(&[0x0C], Duration::from_millis(100))
                .await
                .unwrap_err(),
            ObdError::NotNegotiated
        );

        client.negotiate().await.unwrap();
        client
            .start_monitoring(&[0x0C, 0x0D], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(client.is_monitoring());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let history = client.monitor_history(10);
        assert!(history.len() >= 3);
        let first = history.last().unwrap();
        assert_eq!(first.value(0x0C), Some(7500.0));
        assert_eq!(first.safety_events.len(), 1);
        assert!(history[..history.len() - 1]
            .iter()
            .all(|s| s.safety_events.is_empty()));
        assert_eq!(client.latest_sample(), history.first().cloned());
        assert_eq!(client.monitor_failures().get(&0x0D), Some(&0));

        client.stop_monitoring().await;
        assert!(!client.is_monitoring());
        assert!(client.latest_sample().is_none());
    }

    #[tokio::test]
    async fn test_statistics_and_close() {
        let (sim, mut client) = client(SimulatorConfig::default()).await;
        client.negotiate().await.unwrap();
        client.query(0x0D).await.unwrap();
        client.query(0x05).await.unwrap();

        let stats = client.statistics().await;
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 2);
        assert!(!client.needs_renegotiation().await);
        assert_eq!(client.read_voltage().await.unwrap(), 12.6);

        let handle = client.closer().handle().unwrap();
        assert!(sim.is_channel_open(handle));
        client.close().await.unwrap();
        assert!(!sim.is_channel_open(handle));
    }
}
