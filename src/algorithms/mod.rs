//! Congestion control algorithms and the table that names them

pub mod bbr;
pub mod compound;
pub mod cubic;
pub mod reno;
pub mod vegas;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use crate::pattern::{Pattern, PatternError};
use crate::{Flow, PatternSender};

/// Algorithm used when a flow asks for a name nobody registered.
pub const FALLBACK_ALGORITHM: &str = "reno";

/// Returns a blank, not yet created, flow instance.
pub type FlowFactory = fn() -> Box<dyn Flow>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("flow algorithm {0} already registered")]
    Duplicate(String),
}

/// Name to factory table.
///
/// Filled once at startup and then handed to the supervisor, which only
/// reads it.
#[derive(Clone)]
pub struct AlgorithmRegistry {
    factories: BTreeMap<&'static str, FlowFactory>,
}

impl AlgorithmRegistry {
    /// Empty table
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Table with every algorithm in this crate
    pub fn with_defaults() -> Self {
        let factories = BTreeMap::from([
            ("reno", reno::new_flow as FlowFactory),
            ("cubic", cubic::new_flow),
            ("vegas", vegas::new_flow),
            ("bbr", bbr::new_flow),
            ("compound", compound::new_flow),
        ]);
        Self { factories }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        factory: FlowFactory,
    ) -> Result<(), RegistryError> {
        if self.factories.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Box<dyn Flow>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Look up `name`, falling back to [`FALLBACK_ALGORITHM`] with a
    /// warning. `None` only if the fallback itself is not registered.
    pub fn get_or_fallback(&self, name: &str) -> Option<Box<dyn Flow>> {
        if let Some(flow) = self.get(name) {
            return Some(flow);
        }

        warn!(
            asked = name,
            registered = ?self.list(),
            "Unknown flow algorithm, using {}",
            FALLBACK_ALGORITHM
        );
        self.get(FALLBACK_ALGORITHM)
    }

    /// List all registered algorithms
    pub fn list(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Send a freshly built pattern, logging instead of failing.
///
/// Builder misuse means nothing is sent; a full or closed queue means the
/// update is lost and the next report retries it.
pub(crate) fn install_pattern(
    sender: Option<&PatternSender>,
    built: Result<Pattern, PatternError>,
) {
    let Some(sender) = sender else {
        warn!("Flow has no datapath sender, pattern not installed");
        return;
    };

    let pattern = match built {
        Ok(p) => p,
        Err(e) => {
            warn!(flow_id = sender.flow_id(), "Failed to compile pattern: {}", e);
            return;
        }
    };

    if let Err(e) = sender.send(pattern) {
        warn!(flow_id = sender.flow_id(), "Failed to send pattern: {}", e);
    }
}
