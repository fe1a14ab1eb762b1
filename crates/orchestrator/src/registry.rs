//! Probe kind to implementation lookup and phase classification.

use std::collections::HashMap;
use std::sync::Arc;

use probe::Probe;
use sentinel_core::ProbeKind;

/// Scheduling stage a probe kind runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Builds the attack surface; runs first, one at a time.
    SurfaceMapping,
    /// Independent checks; fanned out together.
    Concurrent,
    /// Shares the rate-limited completion service; one at a time in declared order.
    Sequential,
}

impl Phase {
    pub fn of(kind: ProbeKind) -> Phase {
        match kind {
            ProbeKind::Crawler => Phase::SurfaceMapping,
            ProbeKind::LlmAnalysis | ProbeKind::RedTeam => Phase::Sequential,
            ProbeKind::Exposure | ProbeKind::HeadersTls | ProbeKind::AuthAbuse | ProbeKind::Sqli | ProbeKind::Xss => {
                Phase::Concurrent
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: HashMap<ProbeKind, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the probe's own kind, replacing any earlier entry.
    pub fn register(&mut self, probe: Arc<dyn Probe>) -> &mut Self {
        self.probes.insert(probe.kind(), probe);
        self
    }

    pub fn with(mut self, probe: Arc<dyn Probe>) -> Self {
        self.register(probe);
        self
    }

    /// Implementation for `kind`, or for [`ProbeKind::DEFAULT`] when `kind`
    /// has none. `None` only when the default is missing too.
    pub fn resolve(&self, kind: ProbeKind) -> Option<Arc<dyn Probe>> {
        self.probes.get(&kind).or_else(|| self.probes.get(&ProbeKind::DEFAULT)).cloned()
    }

    pub fn kinds(&self) -> Vec<ProbeKind> {
        let mut kinds: Vec<ProbeKind> = self.probes.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use probe::ProbeContext;

    struct Named(ProbeKind);

    #[async_trait]
    impl Probe for Named {
        fn kind(&self) -> ProbeKind {
            self.0
        }
        async fn execute(&self, _ctx: &ProbeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn missing_kind_resolves_to_default() {
        let reg = ProbeRegistry::new().with(Arc::new(Named(ProbeKind::Exposure))).with(Arc::new(Named(ProbeKind::Xss)));
        assert_eq!(reg.resolve(ProbeKind::Xss).unwrap().kind(), ProbeKind::Xss);
        assert_eq!(reg.resolve(ProbeKind::RedTeam).unwrap().kind(), ProbeKind::Exposure);
        assert_eq!(reg.resolve(ProbeKind::resolve("custom")).unwrap().kind(), ProbeKind::Exposure);
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        assert!(ProbeRegistry::new().resolve(ProbeKind::Crawler).is_none());
    }

    #[test]
    fn completion_consumers_are_sequential() {
        assert_eq!(Phase::of(ProbeKind::Crawler), Phase::SurfaceMapping);
        assert_eq!(Phase::of(ProbeKind::RedTeam), Phase::Sequential);
        assert_eq!(Phase::of(ProbeKind::LlmAnalysis), Phase::Sequential);
        assert_eq!(Phase::of(ProbeKind::Sqli), Phase::Concurrent);
    }
}
