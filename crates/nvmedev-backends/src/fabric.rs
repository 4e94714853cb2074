//! Fabric backend
//!
//! Reaches NVMe-oF subsystems over RDMA or TCP. Specifiers name one subsystem:
//! `fab://<addr>[:<port>]/<subnqn>[?transport=tcp&nsid=N]`. Enumeration walks
//! the configured targets; there is no discovery-controller crawl.

use nvmedev_core::specifier::SCHEME_FAB;
use nvmedev_core::{DeviceType, NativeError, NativeGeometry, NativeResult, Specifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{
    Backend, BackendScan, EnumerateFilter, FirstError, NativeIdent, OpenOptions,
};
use crate::driver::{
    list_namespaces, AttachedNamespace, ControllerDriver, TransportId, TransportType,
    DEFAULT_TRSVCID,
};

/// A subsystem to list during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricTarget {
    #[serde(default = "default_transport")]
    pub transport: TransportType,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: String,
    pub subnqn: String,
}

fn default_transport() -> TransportType {
    TransportType::Rdma
}

fn default_port() -> String {
    DEFAULT_TRSVCID.to_string()
}

impl FabricTarget {
    fn trid(&self) -> NativeResult<TransportId> {
        TransportId::fabric(self.transport, &self.address, &self.port, &self.subnqn)
            .map_err(|e| NativeError::new(libc::EINVAL, e.to_string()))
    }

    /// Specifier opening namespace `nsid` of this target
    pub fn uri(&self, nsid: u32) -> String {
        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        let path = format!("{}:{}/{}", host, self.port, self.subnqn);
        let mut query = vec![("nsid", nsid.to_string())];
        if self.transport != default_transport() {
            query.push(("transport", self.transport.as_str().to_ascii_lowercase()));
        }
        Specifier::compose(SCHEME_FAB, &path, &query)
    }
}

/// Fabric backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub targets: Vec<FabricTarget>,
}

fn default_enabled() -> bool {
    true
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            targets: Vec::new(),
        }
    }
}

/// An attached fabric namespace
#[derive(Debug)]
pub struct FabricResources {
    attached: Option<AttachedNamespace>,
}

impl FabricResources {
    pub fn trid(&self) -> Option<&TransportId> {
        self.attached.as_ref().map(|a| a.trid())
    }

    fn attached(&self) -> NativeResult<&AttachedNamespace> {
        self.attached
            .as_ref()
            .ok_or_else(|| NativeError::new(libc::EBADF, "subsystem already detached"))
    }
}

#[derive(Debug, Clone)]
pub struct FabricBackend {
    config: FabricConfig,
    driver: Option<Arc<dyn ControllerDriver>>,
}

impl FabricBackend {
    pub fn new(config: FabricConfig, driver: Option<Arc<dyn ControllerDriver>>) -> Self {
        Self { config, driver }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    fn driver(&self) -> NativeResult<&dyn ControllerDriver> {
        self.driver
            .as_deref()
            .ok_or_else(|| NativeError::new(libc::ENODEV, "no fabric controller driver attached"))
    }
}

impl Backend for FabricBackend {
    type Resources = FabricResources;

    const NAME: &'static str = "fab";
    const SCHEME: &'static str = SCHEME_FAB;

    fn probe(&self, spec: &Specifier) -> bool {
        spec.has_scheme(SCHEME_FAB)
    }

    fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<FabricResources> {
        let target = parse_target(spec)?;
        let nsid = opts.resolve_nsid(spec)?.unwrap_or(1);
        let trid = target.trid()?;

        let attached = AttachedNamespace::attach(self.driver()?, &trid, nsid, opts.io_queue_size)?;
        debug!(trid = %trid, nsid, "Attached fabric namespace");
        Ok(FabricResources {
            attached: Some(attached),
        })
    }

    fn close(&self, mut resources: FabricResources) -> NativeResult<()> {
        let mut errors = FirstError::default();
        if let Some(attached) = resources.attached.take() {
            errors.record(attached.release());
        }
        errors.finish()
    }

    fn identify(&self, spec: &Specifier, resources: &FabricResources) -> NativeResult<NativeIdent> {
        let attached = resources.attached()?;
        let ns = attached.namespace_data()?;
        Ok(NativeIdent {
            nsid: ns.nsid,
            nst: ns.csi,
            dtype: DeviceType::Namespace,
            uri: spec.raw().to_string(),
            be_uri: attached.trid().to_string(),
        })
    }

    fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan> {
        let mut scan = BackendScan::new();
        if self.config.targets.is_empty() {
            return Ok(scan);
        }
        let driver = self.driver()?;

        let mut reached = 0usize;
        for target in &self.config.targets {
            let result = target
                .trid()
                .and_then(|trid| list_namespaces(driver, &trid).map(|ns| (trid, ns)));
            match result {
                Ok((trid, namespaces)) => {
                    reached += 1;
                    for ns in namespaces {
                        scan.push(NativeIdent {
                            nsid: ns.nsid,
                            nst: ns.csi,
                            dtype: DeviceType::Namespace,
                            uri: target.uri(ns.nsid),
                            be_uri: trid.to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!(address = %target.address, subnqn = %target.subnqn, error = %e, "Fabric target unreachable");
                    scan.fail(NativeError::new(
                        e.code,
                        format!("{}/{}: {}", target.address, target.subnqn, e.message),
                    ));
                }
            }
        }

        // nothing answered: the backend as a whole failed
        if reached == 0 && !scan.failures.is_empty() {
            return Err(scan.failures.swap_remove(0));
        }
        scan.retain_matching(filter);
        debug!(
            count = scan.entries.len(),
            failures = scan.failures.len(),
            "Enumerated fabric namespaces"
        );
        Ok(scan)
    }

    fn geometry(&self, resources: &FabricResources) -> NativeResult<NativeGeometry> {
        resources.attached()?.native_geometry()
    }
}

/// Split `host[:port]/subnqn` plus the `transport` query into a target
pub fn parse_target(spec: &Specifier) -> NativeResult<FabricTarget> {
    let invalid = |reason: &str| {
        NativeError::new(
            libc::EINVAL,
            format!("{}: {}", spec.raw(), reason),
        )
    };

    let (hostport, subnqn) = spec
        .path()
        .split_once('/')
        .ok_or_else(|| invalid("missing subsystem NQN"))?;
    if subnqn.is_empty() {
        return Err(invalid("missing subsystem NQN"));
    }

    let (address, port) = if let Some(rest) = hostport.strip_prefix('[') {
        let (address, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 address"))?;
        match after.strip_prefix(':') {
            Some(port) => (address, port),
            None if after.is_empty() => (address, DEFAULT_TRSVCID),
            None => return Err(invalid("garbage after IPv6 address")),
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((address, port)) => (address, port),
            None => (hostport, DEFAULT_TRSVCID),
        }
    };
    if address.is_empty() {
        return Err(invalid("missing address"));
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("port is not numeric"));
    }

    let transport = match spec.query("transport") {
        Some(t) => match TransportType::parse(t) {
            Some(TransportType::Pcie) | None => {
                return Err(invalid(&format!("unsupported transport {:?}", t)))
            }
            Some(t) => t,
        },
        None => default_transport(),
    };

    Ok(FabricTarget {
        transport,
        address: address.to_string(),
        port: port.to_string(),
        subnqn: subnqn.to_string(),
    })
}
