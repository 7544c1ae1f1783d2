/*
[INPUT]:  Ordered endpoint candidates and named venue regions
[OUTPUT]: Next endpoint to try, exhaustion signal after a full cycle
[POS]:    Connection layer - region selection and failover ordering
[UPDATE]: When the venue adds/removes regions or failover ordering changes
*/

use std::fmt;

use url::Url;

use crate::error::{Result, SessionError};

/// Named regions served by the venue, in preference order.
const REGIONS: &[(&str, &str)] = &[
    ("EUROPA", "wss://api-eu.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SEYCHELLES", "wss://api-sc.po.market/socket.io/?EIO=4&transport=websocket"),
    ("HONGKONG", "wss://api-hk.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SERVER1", "wss://api-spb.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FRANCE2", "wss://api-fr2.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES4", "wss://api-us4.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES3", "wss://api-us3.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES2", "wss://api-us2.po.market/socket.io/?EIO=4&transport=websocket"),
    ("DEMO", "wss://demo-api-eu.po.market/socket.io/?EIO=4&transport=websocket"),
    ("DEMO_2", "wss://try-demo-eu.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES", "wss://api-us-north.po.market/socket.io/?EIO=4&transport=websocket"),
    ("RUSSIA", "wss://api-msk.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SERVER2", "wss://api-l.po.market/socket.io/?EIO=4&transport=websocket"),
    ("INDIA", "wss://api-in.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FRANCE", "wss://api-fr.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FINLAND", "wss://api-fin.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SERVER3", "wss://api-c.po.market/socket.io/?EIO=4&transport=websocket"),
    ("ASIA", "wss://api-asia.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SERVER4", "wss://api-us-south.po.market/socket.io/?EIO=4&transport=websocket"),
];

/// One candidate network address for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub region: String,
    pub priority: u32,
}

impl Endpoint {
    /// Build an endpoint from a URL string.
    pub fn new(url: &str, region: impl Into<String>, priority: u32) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| SessionError::Config(format!("invalid endpoint url {url}: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::Config(format!(
                    "endpoint scheme must be ws or wss, got {other}"
                )));
            }
        }
        Ok(Self {
            url,
            region: region.into(),
            priority,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.region, self.url)
    }
}

/// All named regions as `(name, url)` pairs.
pub fn catalog() -> &'static [(&'static str, &'static str)] {
    REGIONS
}

/// Resolve a region by case-insensitive name.
pub fn lookup(name: &str) -> Option<&'static str> {
    REGIONS
        .iter()
        .find(|(region, _)| region.eq_ignore_ascii_case(name))
        .map(|(_, url)| *url)
}

/// Endpoints for real-money accounts, in catalog order.
pub fn live_endpoints() -> Vec<Endpoint> {
    catalog_endpoints(|name| !name.starts_with("DEMO"))
}

/// Endpoints for demo accounts.
pub fn demo_endpoints() -> Vec<Endpoint> {
    catalog_endpoints(|name| name.starts_with("DEMO"))
}

/// Build endpoints from region names, keeping the given order as priority.
pub fn endpoints_for(names: &[impl AsRef<str>]) -> Result<Vec<Endpoint>> {
    names
        .iter()
        .enumerate()
        .map(|(priority, name)| {
            let name = name.as_ref();
            let url = lookup(name)
                .ok_or_else(|| SessionError::Config(format!("unknown region {name}")))?;
            Endpoint::new(url, name.to_ascii_uppercase(), priority as u32)
        })
        .collect()
}

fn catalog_endpoints(filter: impl Fn(&str) -> bool) -> Vec<Endpoint> {
    REGIONS
        .iter()
        .filter(|(name, _)| filter(name))
        .enumerate()
        .filter_map(|(priority, (name, url))| Endpoint::new(url, *name, priority as u32).ok())
        .collect()
}

/// Ordered candidate list with a failover cursor.
///
/// `next_endpoint` walks the candidates once, returns `None` after the last one
/// and rewinds, so a caller that backs off and asks again starts a fresh cycle.
#[derive(Debug, Clone)]
pub struct RegionSelector {
    candidates: Vec<Endpoint>,
    cursor: usize,
}

impl RegionSelector {
    pub fn new(mut candidates: Vec<Endpoint>) -> Self {
        // stable: equal priorities keep configuration order
        candidates.sort_by_key(|endpoint| endpoint.priority);
        Self {
            candidates,
            cursor: 0,
        }
    }

    /// Next candidate, or `None` once per exhausted cycle.
    pub fn next_endpoint(&mut self) -> Option<Endpoint> {
        match self.candidates.get(self.cursor) {
            Some(endpoint) => {
                self.cursor += 1;
                Some(endpoint.clone())
            }
            None => {
                self.cursor = 0;
                None
            }
        }
    }

    /// Restart from the highest-priority candidate.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, priority: u32) -> Endpoint {
        Endpoint::new(&format!("wss://{name}.example/socket.io/"), name, priority).unwrap()
    }

    #[test]
    fn selector_walks_by_priority_then_signals_exhaustion() {
        let mut selector = RegionSelector::new(vec![
            endpoint("c", 2),
            endpoint("a", 0),
            endpoint("b", 1),
        ]);

        let order: Vec<_> = std::iter::from_fn(|| selector.next_endpoint())
            .map(|endpoint| endpoint.region)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        // wrapped: the next cycle starts over
        assert_eq!(selector.next_endpoint().unwrap().region, "a");
    }

    #[test]
    fn selector_reset_rewinds_cursor() {
        let mut selector = RegionSelector::new(vec![endpoint("a", 0), endpoint("b", 1)]);
        selector.next_endpoint();
        selector.next_endpoint();
        selector.reset();
        assert_eq!(selector.next_endpoint().unwrap().region, "a");
    }

    #[test]
    fn empty_selector_is_always_exhausted() {
        let mut selector = RegionSelector::new(Vec::new());
        assert!(selector.is_empty());
        assert!(selector.next_endpoint().is_none());
        assert!(selector.next_endpoint().is_none());
    }

    #[test]
    fn catalog_splits_demo_and_live() {
        let demo = demo_endpoints();
        assert_eq!(demo.len(), 2);
        assert!(demo.iter().all(|endpoint| endpoint.region.starts_with("DEMO")));
        assert_eq!(live_endpoints().len(), catalog().len() - 2);
    }

    #[test]
    fn region_lookup_is_case_insensitive() {
        assert_eq!(
            lookup("europa"),
            Some("wss://api-eu.po.market/socket.io/?EIO=4&transport=websocket")
        );
        assert!(lookup("atlantis").is_none());

        let endpoints = endpoints_for(&["asia", "Europa"]).unwrap();
        assert_eq!(endpoints[0].region, "ASIA");
        assert_eq!(endpoints[1].priority, 1);
        assert!(endpoints_for(&["atlantis"]).is_err());
    }

    #[test]
    fn endpoint_rejects_non_websocket_scheme() {
        assert!(Endpoint::new("https://api-eu.po.market", "EU", 0).is_err());
        assert!(Endpoint::new("not a url", "EU", 0).is_err());
    }
}
