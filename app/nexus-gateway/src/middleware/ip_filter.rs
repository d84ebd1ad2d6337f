//! IP allow/deny filtering driven by the dynamic configuration

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::dynamic::{DynamicConfigHolder, IpFilterSection};
use crate::error::{codes, gateway_error};
use crate::middleware::TraceId;

/// A single allow/deny entry: exact address or CIDR block
#[derive(Debug, Clone)]
pub enum IpEntry {
    Addr(IpAddr),
    Net(IpNet),
}

impl IpEntry {
    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpEntry::Addr(addr) => *addr == ip,
            IpEntry::Net(net) => net.contains(&ip),
        }
    }
}

/// Parse configured addresses; unparseable entries are skipped
pub fn parse_entries(addresses: &[String]) -> Vec<IpEntry> {
    let mut entries = Vec::with_capacity(addresses.len());
    for address in addresses {
        if let Ok(net) = address.parse::<IpNet>() {
            entries.push(IpEntry::Net(net));
        } else if let Ok(addr) = address.parse::<IpAddr>() {
            entries.push(IpEntry::Addr(addr));
        } else {
            warn!("skip unparseable ip filter entry: {}", address);
        }
    }
    entries
}

pub fn matches(ip: IpAddr, entries: &[IpEntry]) -> bool {
    entries.iter().any(|entry| entry.matches(ip))
}

/// Filter state: the holder plus parsed entries cached until the
/// underlying section changes.
pub struct IpFilterState {
    holder: Arc<DynamicConfigHolder>,
    cache: Mutex<Option<(IpFilterSection, Vec<IpEntry>)>>,
}

impl IpFilterState {
    pub fn new(holder: Arc<DynamicConfigHolder>) -> Self {
        Self {
            holder,
            cache: Mutex::new(None),
        }
    }

    fn entries_for(&self, section: &IpFilterSection) -> Vec<IpEntry> {
        let mut cache = self.cache.lock().expect("ip filter cache poisoned");
        match cache.as_ref() {
            Some((cached, entries)) if cached == section => entries.clone(),
            _ => {
                let entries = parse_entries(&section.addresses);
                *cache = Some((section.clone(), entries.clone()));
                entries
            }
        }
    }
}

/// Reject requests per the configured whitelist or blacklist with `403`
/// code `1002`.
pub async fn ip_filter(
    State(state): State<Arc<IpFilterState>>,
    request: Request,
    next: Next,
) -> Response<Body> {
    let cfg = state.holder.load();
    if !cfg.ip_filter.enabled {
        return next.run(request).await;
    }

    let Some(client_ip) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
    else {
        return next.run(request).await;
    };

    let entries = state.entries_for(&cfg.ip_filter);
    let matched = matches(client_ip, &entries);

    let rejection = match cfg.ip_filter.mode.as_str() {
        "whitelist" if !matched => Some("ip not allowed"),
        "blacklist" if matched => Some("ip blocked"),
        _ => None,
    };

    if let Some(message) = rejection {
        let trace_id = request
            .extensions()
            .get::<TraceId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        return gateway_error(codes::IP_BLOCKED, message, &trace_id);
    }

    next.run(request).await
}
