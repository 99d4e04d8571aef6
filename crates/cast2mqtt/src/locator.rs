//! Device locator: turns configuration into a reachable [`DeviceEndpoint`].
//!
//! Resolution order: explicit address, then the discovery cache, then active
//! mDNS discovery. Resolution never connects to the device.

use std::io::{BufRead, Write};

use crate::cache::DiscoveryCache;
use crate::config::LocatorConfig;
use crate::device::{DEFAULT_CAST_PORT, DeviceEndpoint, DiscoveredDevice};
use crate::discovery::{Discoverer, DiscoveryError};

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("port needs to be a number > 0: port={0}")]
    InvalidPort(u16),
    #[error("no cast devices found on network")]
    NoDevices,
    #[error("unable to find cast dns entry: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("device selection aborted: {0}")]
    Selection(String),
}

/// Interactive choice among several discovered devices.
pub trait Selector {
    /// Return an index into `candidates` (already sorted, never empty).
    fn select(&mut self, candidates: &[DiscoveredDevice]) -> Result<usize, LocateError>;
}

/// Prints a numbered list and reads a 1-based choice, asking again on bad input.
pub struct PromptSelector<R, W> {
    input: R,
    output: W,
}

impl PromptSelector<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Selector for PromptSelector<R, W> {
    fn select(&mut self, candidates: &[DiscoveredDevice]) -> Result<usize, LocateError> {
        let io_err = |e: std::io::Error| LocateError::Selection(e.to_string());
        writeln!(self.output, "Found {} cast dns entries, select one:", candidates.len())
            .map_err(io_err)?;
        for (i, d) in candidates.iter().enumerate() {
            writeln!(
                self.output,
                "{}) device={:?} device_name={:?} address=\"{}:{}\" uuid={:?}",
                i + 1,
                d.device,
                d.device_name,
                d.address,
                d.port,
                d.uuid
            )
            .map_err(io_err)?;
        }
        loop {
            write!(self.output, "Enter selection: ").map_err(io_err)?;
            self.output.flush().map_err(io_err)?;
            let mut line = String::new();
            if self.input.read_line(&mut line).map_err(io_err)? == 0 {
                return Err(LocateError::Selection("end of input".to_string()));
            }
            match line.trim().parse::<usize>() {
                Ok(n) if (1..=candidates.len()).contains(&n) => return Ok(n - 1),
                _ => continue,
            }
        }
    }
}

pub struct DeviceLocator<D, S> {
    cache: Option<DiscoveryCache>,
    discoverer: D,
    selector: S,
}

impl<D: Discoverer, S: Selector> DeviceLocator<D, S> {
    /// `cache` is `None` when caching is disabled.
    pub fn new(cache: Option<DiscoveryCache>, discoverer: D, selector: S) -> Self {
        Self {
            cache,
            discoverer,
            selector,
        }
    }

    pub fn resolve(&mut self, config: &LocatorConfig) -> Result<DeviceEndpoint, LocateError> {
        if let Some(address) = config.address.as_deref() {
            let port = config.port.unwrap_or(DEFAULT_CAST_PORT);
            if port == 0 {
                return Err(LocateError::InvalidPort(port));
            }
            tracing::info!(address = %address, port, "using configured device address");
            return Ok(DeviceEndpoint::explicit(address, port));
        }

        if let Some(endpoint) = self.cached(config) {
            tracing::info!(
                name = ?endpoint.name,
                uuid = ?endpoint.uuid,
                address = %endpoint.address,
                port = endpoint.port,
                "device found in cache"
            );
            return Ok(endpoint);
        }

        let endpoint = self.discover(config)?.into_endpoint();
        if let Some(cache) = self.cache.as_ref() {
            if let Err(e) = cache.remember(&endpoint) {
                tracing::warn!(error = %format!("{e:#}"), "cache: unable to store device");
            }
        }
        tracing::info!(
            name = ?endpoint.name,
            uuid = ?endpoint.uuid,
            address = %endpoint.address,
            port = endpoint.port,
            "device found"
        );
        Ok(endpoint)
    }

    fn cached(&self, config: &LocatorConfig) -> Option<DeviceEndpoint> {
        let cache = self.cache.as_ref()?;
        let ids = [config.device_name.as_deref(), config.device_uuid.as_deref()];
        if ids.iter().all(Option::is_none) {
            return None;
        }
        match cache.lookup(ids.into_iter().flatten()) {
            Ok(entry) => entry.map(|e| e.into_endpoint()),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "cache: lookup failed");
                None
            }
        }
    }

    fn discover(&mut self, config: &LocatorConfig) -> Result<DiscoveredDevice, LocateError> {
        let stream = self
            .discoverer
            .discover(config.iface.as_deref(), config.dns_timeout)?;

        let mut found = Vec::new();
        for entry in stream {
            if config.use_first_device || config.matches(&entry) {
                return Ok(entry);
            }
            found.push(entry);
        }

        if found.is_empty() {
            return Err(LocateError::NoDevices);
        }
        found.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        if found.len() == 1 {
            return Ok(found.remove(0));
        }
        let idx = self.selector.select(&found)?;
        if idx >= found.len() {
            return Err(LocateError::Selection(format!("index {idx} out of range")));
        }
        Ok(found.swap_remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cache_key;
    use crate::device::EndpointOrigin;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;
    use std::time::Duration;

    struct ScriptedDiscoverer {
        devices: Vec<DiscoveredDevice>,
        calls: Rc<Cell<usize>>,
    }

    impl ScriptedDiscoverer {
        fn new(devices: Vec<DiscoveredDevice>) -> Self {
            Self {
                devices,
                calls: Rc::new(Cell::new(0)),
            }
        }
    }

    impl Discoverer for ScriptedDiscoverer {
        fn discover(
            &self,
            _iface: Option<&str>,
            _timeout: Duration,
        ) -> Result<crossbeam_channel::Receiver<DiscoveredDevice>, DiscoveryError> {
            self.calls.set(self.calls.get() + 1);
            let (tx, rx) = crossbeam_channel::unbounded();
            for d in &self.devices {
                tx.send(d.clone()).expect("send");
            }
            Ok(rx)
        }
    }

    struct FixedSelector {
        choice: usize,
        seen: Rc<std::cell::RefCell<Vec<String>>>,
    }

    impl Selector for FixedSelector {
        fn select(&mut self, candidates: &[DiscoveredDevice]) -> Result<usize, LocateError> {
            *self.seen.borrow_mut() = candidates.iter().map(|d| d.device_name.clone()).collect();
            Ok(self.choice)
        }
    }

    struct NoPrompt;

    impl Selector for NoPrompt {
        fn select(&mut self, _candidates: &[DiscoveredDevice]) -> Result<usize, LocateError> {
            panic!("selection prompt must not be shown");
        }
    }

    fn device(name: &str, uuid: &str, addr: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            uuid: uuid.to_string(),
            device_name: name.to_string(),
            device: "Chromecast".to_string(),
            address: addr.to_string(),
            port: 8009,
        }
    }

    fn interactive() -> LocatorConfig {
        LocatorConfig {
            use_first_device: false,
            ..LocatorConfig::default()
        }
    }

    #[test]
    fn explicit_address_skips_discovery_and_defaults_port() {
        let discoverer = ScriptedDiscoverer::new(vec![device("A", "a", "10.0.0.1")]);
        let calls = discoverer.calls.clone();
        let mut locator = DeviceLocator::new(None, discoverer, NoPrompt);
        let config = LocatorConfig {
            address: Some("10.0.0.9".to_string()),
            ..LocatorConfig::default()
        };

        let endpoint = locator.resolve(&config).expect("resolve");
        assert_eq!(endpoint.address, "10.0.0.9");
        assert_eq!(endpoint.port, DEFAULT_CAST_PORT);
        assert_eq!(endpoint.origin, EndpointOrigin::ExplicitConfig);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn explicit_address_with_zero_port_is_rejected() {
        let mut locator = DeviceLocator::new(None, ScriptedDiscoverer::new(Vec::new()), NoPrompt);
        let config = LocatorConfig {
            address: Some("10.0.0.9".to_string()),
            port: Some(0),
            ..LocatorConfig::default()
        };
        assert!(matches!(locator.resolve(&config), Err(LocateError::InvalidPort(0))));
    }

    #[test]
    fn zero_candidates_is_an_error() {
        let mut locator =
            DeviceLocator::new(None, ScriptedDiscoverer::new(Vec::new()), NoPrompt);
        assert!(matches!(locator.resolve(&interactive()), Err(LocateError::NoDevices)));
    }

    #[test]
    fn single_candidate_is_returned_without_prompt() {
        let discoverer = ScriptedDiscoverer::new(vec![device("Office", "o-1", "10.0.0.3")]);
        let mut locator = DeviceLocator::new(None, discoverer, NoPrompt);
        let endpoint = locator.resolve(&interactive()).expect("resolve");
        assert_eq!(endpoint.name.as_deref(), Some("Office"));
        assert_eq!(endpoint.origin, EndpointOrigin::Discovered);
    }

    #[test]
    fn multiple_candidates_are_sorted_by_name_before_selection() {
        let discoverer = ScriptedDiscoverer::new(vec![
            device("Office", "o-1", "10.0.0.3"),
            device("Bedroom", "b-1", "10.0.0.4"),
            device("Kitchen", "k-1", "10.0.0.5"),
        ]);
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let selector = FixedSelector {
            choice: 1,
            seen: seen.clone(),
        };
        let mut locator = DeviceLocator::new(None, discoverer, selector);

        let endpoint = locator.resolve(&interactive()).expect("resolve");
        assert_eq!(*seen.borrow(), vec!["Bedroom", "Kitchen", "Office"]);
        assert_eq!(endpoint.name.as_deref(), Some("Kitchen"));
    }

    #[test]
    fn first_device_mode_takes_stream_head() {
        let discoverer = ScriptedDiscoverer::new(vec![
            device("Office", "o-1", "10.0.0.3"),
            device("Bedroom", "b-1", "10.0.0.4"),
        ]);
        let mut locator = DeviceLocator::new(None, discoverer, NoPrompt);
        let config = LocatorConfig {
            use_first_device: true,
            ..LocatorConfig::default()
        };
        let endpoint = locator.resolve(&config).expect("resolve");
        assert_eq!(endpoint.name.as_deref(), Some("Office"));
    }

    #[test]
    fn filter_matches_uuid_name_or_device_type() {
        let mut tv = device("Living Room TV", "tv-1", "10.0.0.7");
        tv.device = "Google TV".to_string();
        let devices = vec![
            device("Office", "o-1", "10.0.0.3"),
            device("Bedroom", "b-1", "10.0.0.4"),
            tv,
        ];

        let by_uuid = LocatorConfig {
            device_uuid: Some("b-1".to_string()),
            ..interactive()
        };
        let by_name = LocatorConfig {
            device_name: Some("Office".to_string()),
            ..interactive()
        };
        let by_type = LocatorConfig {
            device_type: Some("Google TV".to_string()),
            ..interactive()
        };

        for (config, expected) in [(by_uuid, "Bedroom"), (by_name, "Office"), (by_type, "Living Room TV")] {
            let mut locator =
                DeviceLocator::new(None, ScriptedDiscoverer::new(devices.clone()), NoPrompt);
            let endpoint = locator.resolve(&config).expect("resolve");
            assert_eq!(endpoint.name.as_deref(), Some(expected));
        }
    }

    #[test]
    fn discovery_result_is_cached_under_both_keys() {
        let cache = DiscoveryCache::in_memory().expect("cache");
        let discoverer = ScriptedDiscoverer::new(vec![device("Office", "o-1", "10.0.0.3")]);
        let mut locator = DeviceLocator::new(Some(cache.clone()), discoverer, NoPrompt);
        let config = LocatorConfig {
            device_name: Some("Office".to_string()),
            ..interactive()
        };

        locator.resolve(&config).expect("resolve");
        assert!(cache.load(&cache_key("Office")).expect("load").is_some());
        assert!(cache.load(&cache_key("o-1")).expect("load").is_some());
    }

    #[test]
    fn cache_hit_skips_discovery() {
        let cache = DiscoveryCache::in_memory().expect("cache");
        let mut cached = device("Office", "o-1", "10.0.0.3").into_endpoint();
        cached.address = "10.0.0.99".to_string();
        cache.remember(&cached).expect("remember");

        let discoverer = ScriptedDiscoverer::new(vec![device("Office", "o-1", "10.0.0.3")]);
        let calls = discoverer.calls.clone();
        let mut locator = DeviceLocator::new(Some(cache), discoverer, NoPrompt);
        let config = LocatorConfig {
            device_uuid: Some("o-1".to_string()),
            ..interactive()
        };

        let endpoint = locator.resolve(&config).expect("resolve");
        assert_eq!(endpoint.address, "10.0.0.99");
        assert_eq!(endpoint.origin, EndpointOrigin::CacheHit);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn invalidated_cache_falls_back_to_discovery() {
        let cache = DiscoveryCache::in_memory().expect("cache");
        let stale = device("Office", "o-1", "10.0.0.99").into_endpoint();
        cache.remember(&stale).expect("remember");
        cache.invalidate(&stale).expect("invalidate");

        let discoverer = ScriptedDiscoverer::new(vec![device("Office", "o-1", "10.0.0.3")]);
        let calls = discoverer.calls.clone();
        let mut locator = DeviceLocator::new(Some(cache), discoverer, NoPrompt);
        let config = LocatorConfig {
            device_name: Some("Office".to_string()),
            ..interactive()
        };

        let endpoint = locator.resolve(&config).expect("resolve");
        assert_eq!(endpoint.address, "10.0.0.3");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn prompt_selector_reprompts_until_valid() {
        let candidates = vec![device("A", "a", "10.0.0.1"), device("B", "b", "10.0.0.2")];
        let input = Cursor::new("abc\n7\n0\n2\n");
        let mut output = Vec::new();
        let idx = PromptSelector::new(input, &mut output)
            .select(&candidates)
            .expect("select");
        assert_eq!(idx, 1);

        let printed = String::from_utf8(output).expect("utf8");
        assert!(printed.contains("Found 2 cast dns entries"));
        assert!(printed.contains("2) device=\"Chromecast\" device_name=\"B\" address=\"10.0.0.2:8009\""));
        assert_eq!(printed.matches("Enter selection: ").count(), 4);
    }

    #[test]
    fn prompt_selector_fails_on_end_of_input() {
        let candidates = vec![device("A", "a", "10.0.0.1"), device("B", "b", "10.0.0.2")];
        let mut selector = PromptSelector::new(Cursor::new("x\n"), Vec::new());
        assert!(matches!(
            selector.select(&candidates),
            Err(LocateError::Selection(_))
        ));
    }
}
