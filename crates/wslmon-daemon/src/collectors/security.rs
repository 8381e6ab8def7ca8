//! Security posture sampler.
//!
//! Every ten seconds the registered anti-malware and firewall products
//! are enumerated through a posture source; each product's 32-bit state
//! is decoded into `Enabled|Disabled` and `UpToDate|Outdated` flags, and
//! the record is promoted to Warning when the decoded state contains
//! `Disabled` or `Outdated`. For a fixed set of vendor service names a
//! companion record carries the vendor service's current state.
//!
//! The default source queries the `root/SecurityCenter2` CIM namespace
//! through `powershell.exe`, which works natively on the host and via
//! interop from the guest; vendor probes go through `sc.exe`.

use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, EventRecord, Severity};

use super::service_state::{ScQueryServiceSource, ServiceStateSource};
use super::{contains_any_keyword, record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "security.center";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

const ENABLED_MASK: u32 = 0x10;
const UP_TO_DATE_MASK: u32 = 0x1000;

/// The SecurityCenter2 classes to enumerate, with their suite tags.
const DEFAULT_SUITES: &[(&str, &str)] = &[
    ("AntiVirusProduct", "ThirdPartyAV"),
    ("AntiSpywareProduct", "ThirdPartyAS"),
    ("FirewallProduct", "ThirdPartyFW"),
];

/// One registered security product.
#[derive(Debug, Clone, Default)]
pub struct SecurityProduct {
    /// Product display name.
    pub name: String,
    /// Suite bucket (`ThirdPartyAV`, `ThirdPartyAS`, `ThirdPartyFW`).
    pub suite: String,
    /// Raw 32-bit product state.
    pub state: u32,
    /// Signed product executable path, when reported.
    pub product_exe: Option<String>,
    /// Signed reporting executable path, when reported.
    pub reporting_exe: Option<String>,
    /// Product instance identifier, when reported.
    pub instance_guid: Option<String>,
}

/// A source of registered security products.
pub trait SecurityPostureSource: Send {
    /// Enumerates the currently registered products.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the security posture API is unavailable.
    fn products(&mut self) -> io::Result<Vec<SecurityProduct>>;
}

/// Enumerates `root/SecurityCenter2` products through `powershell.exe`.
pub struct CimSecurityCenterSource {
    command: String,
    suites: Vec<(String, String)>,
}

impl CimSecurityCenterSource {
    /// Source over the platform PowerShell and the default class set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("powershell.exe")
    }

    /// Source over an injected shell command (tests use a stub script).
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            suites: DEFAULT_SUITES
                .iter()
                .map(|(class, suite)| ((*class).to_string(), (*suite).to_string()))
                .collect(),
        }
    }
}

impl Default for CimSecurityCenterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityPostureSource for CimSecurityCenterSource {
    fn products(&mut self) -> io::Result<Vec<SecurityProduct>> {
        let mut products = Vec::new();
        for (class, suite) in &self.suites {
            let script = format!(
                "Get-CimInstance -Namespace root/SecurityCenter2 -ClassName {class} \
                 -ErrorAction SilentlyContinue | Select-Object displayName,productState,\
                 pathToSignedProductExe,pathToSignedReportingExe,instanceGuid | \
                 ConvertTo-Json -Compress"
            );
            let output = Command::new(&self.command)
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .output()?;
            if !output.status.success() {
                return Err(io::Error::other(format!(
                    "security posture query exited with {}",
                    output.status
                )));
            }
            products.extend(parse_cim_products(
                &String::from_utf8_lossy(&output.stdout),
                suite,
            ));
        }
        Ok(products)
    }
}

/// Parses the `ConvertTo-Json` output of one class query. PowerShell
/// emits a bare object for a single product and an array otherwise;
/// entries without a display name are dropped.
pub(crate) fn parse_cim_products(json: &str, suite: &str) -> Vec<SecurityProduct> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Vec::new();
    };
    let items: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        object @ serde_json::Value::Object(_) => vec![object],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let name = item.get("displayName")?.as_str()?.to_string();
            #[allow(clippy::cast_possible_truncation)]
            let state = item
                .get("productState")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u32;
            let text = |key: &str| {
                item.get(key)
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            };
            Some(SecurityProduct {
                name,
                suite: suite.to_string(),
                state,
                product_exe: text("pathToSignedProductExe"),
                reporting_exe: text("pathToSignedReportingExe"),
                instance_guid: text("instanceGuid"),
            })
        })
        .collect()
}

/// Decodes the product state bits into the flag text.
#[must_use]
pub fn decode_product_state(state: u32) -> String {
    let enabled = if state & ENABLED_MASK != 0 {
        "Enabled"
    } else {
        "Disabled"
    };
    let freshness = if state & UP_TO_DATE_MASK != 0 {
        "UpToDate"
    } else {
        "Outdated"
    };
    format!("{enabled}|{freshness}")
}

/// A vendor service probe: when a product name contains the vendor
/// fragment, the named service's state is sampled as a companion record.
#[derive(Debug, Clone)]
pub struct VendorProbe {
    /// Service name to query.
    pub service_name: String,
    /// Case-insensitive fragment matched against the product name.
    pub vendor_fragment: String,
    /// Human-readable component label.
    pub component: String,
}

impl VendorProbe {
    fn new(service_name: &str, vendor_fragment: &str, component: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            vendor_fragment: vendor_fragment.to_string(),
            component: component.to_string(),
        }
    }
}

/// The vendor services worth probing when their product is registered.
#[must_use]
pub fn default_vendor_probes() -> Vec<VendorProbe> {
    vec![
        VendorProbe::new("SepMasterService", "symantec", "Symantec Endpoint"),
        VendorProbe::new("mfemms", "mcafee", "McAfee Endpoint"),
        VendorProbe::new("CSFalconService", "crowdstrike", "CrowdStrike Sensor"),
        VendorProbe::new("SentinelAgent", "sentinel", "SentinelOne Agent"),
        VendorProbe::new("ossecsvc", "trend", "TrendMicro/OSSEC"),
    ]
}

/// Security posture collector.
pub struct SecurityCollector {
    source: Option<Box<dyn SecurityPostureSource>>,
    service_source: Option<Box<dyn ServiceStateSource>>,
    probes: Vec<VendorProbe>,
    worker: WorkerHandle,
}

impl SecurityCollector {
    /// Collector over the SecurityCenter2 CIM query, with vendor probes
    /// through `sc.exe`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(CimSecurityCenterSource::new()))
            .with_service_source(Box::new(ScQueryServiceSource::new()))
    }

    /// Collector over an injected posture source; vendor probes are
    /// skipped unless a service source is attached.
    #[must_use]
    pub fn with_source(source: Box<dyn SecurityPostureSource>) -> Self {
        Self {
            source: Some(source),
            service_source: None,
            probes: default_vendor_probes(),
            worker: WorkerHandle::new(),
        }
    }

    /// Attaches the service source used by the vendor probes.
    #[must_use]
    pub fn with_service_source(mut self, source: Box<dyn ServiceStateSource>) -> Self {
        self.service_source = Some(source);
        self
    }

    /// Replaces the default vendor probe set.
    #[must_use]
    pub fn with_probes(mut self, probes: Vec<VendorProbe>) -> Self {
        self.probes = probes;
        self
    }
}

impl Default for SecurityCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for SecurityCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        let service_source = self.service_source.take();
        let probes = self.probes.clone();
        self.worker.spawn(
            SOURCE,
            Category::Security,
            supervisor,
            move |supervisor, stop| run(source, service_source, &probes, supervisor, stop),
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(
    mut source: Box<dyn SecurityPostureSource>,
    mut service_source: Option<Box<dyn ServiceStateSource>>,
    probes: &[VendorProbe],
    supervisor: &Arc<Supervisor>,
    stop: &StopSignal,
) {
    let mut last_error: Option<String> = None;
    while !stop.wait_timeout(SAMPLE_INTERVAL) {
        let products = match source.products() {
            Ok(products) => products,
            Err(err) => {
                let message = err.to_string();
                if last_error.as_deref() != Some(&message) {
                    let mut failure = record(
                        SOURCE,
                        Category::Security,
                        Severity::Warning,
                        "Security product query failed",
                    );
                    failure.set_attribute("error", &message);
                    supervisor.emit(failure);
                    last_error = Some(message);
                }
                continue;
            },
        };
        last_error = None;

        for product in products {
            supervisor.emit(product_record(&product));
            if let Some(service_source) = service_source.as_mut() {
                for probe in probes {
                    if let Some(event) = probe_record(service_source.as_mut(), probe, &product) {
                        supervisor.emit(event);
                    }
                }
            }
        }
    }
}

fn product_record(product: &SecurityProduct) -> EventRecord {
    let state_text = decode_product_state(product.state);
    let severity = if contains_any_keyword(&state_text, &["disabled", "outdated"]) {
        Severity::Warning
    } else {
        Severity::Info
    };
    let mut event = record(
        SOURCE,
        Category::Security,
        severity,
        "Security product state",
    );
    event.set_attribute("suite", &product.suite);
    event.set_attribute("name", &product.name);
    if let Some(product_exe) = &product.product_exe {
        event.set_attribute("productExe", product_exe);
    }
    if let Some(reporting_exe) = &product.reporting_exe {
        event.set_attribute("reportingExe", reporting_exe);
    }
    if let Some(instance_guid) = &product.instance_guid {
        event.set_attribute("instanceGuid", instance_guid);
    }
    event.set_attribute("productState", product.state.to_string());
    event.set_attribute("stateText", state_text);
    event
}

fn probe_record(
    service_source: &mut dyn ServiceStateSource,
    probe: &VendorProbe,
    product: &SecurityProduct,
) -> Option<EventRecord> {
    if !product
        .name
        .to_lowercase()
        .contains(&probe.vendor_fragment.to_lowercase())
    {
        return None;
    }
    let mut event = record(SOURCE, Category::Security, Severity::Info, "");
    event.set_attribute("vendor", &product.name);
    event.set_attribute("suite", &product.suite);
    event.set_attribute("probe", &probe.component);
    event.set_attribute("service", &probe.service_name);
    match service_source.query(&probe.service_name) {
        Ok(status) => {
            event.severity = if status.state.to_lowercase().contains("running")
                || status.state.to_lowercase().contains("active")
            {
                Severity::Info
            } else {
                Severity::Warning
            };
            event.message = "Vendor service state".to_string();
            event.set_attribute("serviceState", &status.state);
            event.set_attribute("pid", status.pid.to_string());
        },
        Err(err) => {
            event.severity = Severity::Warning;
            event.message = "Vendor service unavailable".to_string();
            event.set_attribute("error", err.to_string());
        },
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::super::service_state::ServiceStatus;
    use super::*;

    #[test]
    fn test_parse_cim_products_array() {
        let json = "[{\"displayName\":\"Acme Shield\",\"productState\":266240,\
                     \"pathToSignedProductExe\":\"C:/acme/shield.exe\",\
                     \"pathToSignedReportingExe\":null,\
                     \"instanceGuid\":\"{11111111-2222-3333-4444-555555555555}\"},\
                    {\"displayName\":\"Windows Defender\",\"productState\":397568}]";
        let products = parse_cim_products(json, "ThirdPartyAV");
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].name, "Acme Shield");
        assert_eq!(products[0].suite, "ThirdPartyAV");
        assert_eq!(products[0].state, 266_240);
        assert_eq!(products[0].product_exe.as_deref(), Some("C:/acme/shield.exe"));
        assert_eq!(products[0].reporting_exe, None);
        assert_eq!(products[1].name, "Windows Defender");
    }

    #[test]
    fn test_parse_cim_products_single_object() {
        // A single product serialises as a bare object, not an array.
        let json = "{\"displayName\":\"Acme Shield\",\"productState\":4096}";
        let products = parse_cim_products(json, "ThirdPartyFW");
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].state, 4096);
    }

    #[test]
    fn test_parse_cim_products_tolerates_garbage() {
        assert!(parse_cim_products("", "ThirdPartyAV").is_empty());
        assert!(parse_cim_products("not json", "ThirdPartyAV").is_empty());
        assert!(parse_cim_products("[{\"productState\":1}]", "ThirdPartyAV").is_empty());
    }

    #[test]
    fn test_decode_product_state() {
        assert_eq!(decode_product_state(0x1010), "Enabled|UpToDate");
        assert_eq!(decode_product_state(0x0010), "Enabled|Outdated");
        assert_eq!(decode_product_state(0x1000), "Disabled|UpToDate");
        assert_eq!(decode_product_state(0x0000), "Disabled|Outdated");
    }

    #[test]
    fn test_product_record_severity() {
        let healthy = SecurityProduct {
            name: "Acme Shield".to_string(),
            suite: "ThirdPartyAV".to_string(),
            state: 0x1010,
            ..SecurityProduct::default()
        };
        assert_eq!(product_record(&healthy).severity, Severity::Info);

        let disabled = SecurityProduct {
            state: 0x1000,
            ..healthy.clone()
        };
        let event = product_record(&disabled);
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.attribute("stateText"), Some("Disabled|UpToDate"));
        assert_eq!(event.attribute("productState"), Some("4096"));
    }

    struct FixedServiceSource(ServiceStatus);

    impl ServiceStateSource for FixedServiceSource {
        fn query(&mut self, _service: &str) -> io::Result<ServiceStatus> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_probe_matches_vendor_fragment() {
        let product = SecurityProduct {
            name: "CrowdStrike Falcon".to_string(),
            suite: "ThirdPartyAV".to_string(),
            state: 0x1010,
            ..SecurityProduct::default()
        };
        let mut source = FixedServiceSource(ServiceStatus {
            state: "Running".to_string(),
            pid: 512,
            exit_code: 0,
            service_exit_code: 0,
        });
        let probes = default_vendor_probes();
        let falcon = probes
            .iter()
            .find(|probe| probe.service_name == "CSFalconService")
            .unwrap();
        let event = probe_record(&mut source, falcon, &product).unwrap();
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.attribute("serviceState"), Some("Running"));

        let symantec = probes
            .iter()
            .find(|probe| probe.service_name == "SepMasterService")
            .unwrap();
        assert!(probe_record(&mut source, symantec, &product).is_none());
    }

    #[test]
    fn test_probe_flags_stopped_vendor_service() {
        let product = SecurityProduct {
            name: "SentinelOne Complete".to_string(),
            suite: "ThirdPartyAV".to_string(),
            state: 0x1010,
            ..SecurityProduct::default()
        };
        let mut source = FixedServiceSource(ServiceStatus {
            state: "Stopped".to_string(),
            pid: 0,
            exit_code: 0,
            service_exit_code: 0,
        });
        let probes = default_vendor_probes();
        let sentinel = probes
            .iter()
            .find(|probe| probe.service_name == "SentinelAgent")
            .unwrap();
        let event = probe_record(&mut source, sentinel, &product).unwrap();
        assert_eq!(event.severity, Severity::Warning);
    }
}
