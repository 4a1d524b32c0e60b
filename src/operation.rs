//! Cache operations, priorities and plan resolution.
//!
//! A caller asks for an [`Operation`]; [`EffectivePlan::resolve`] turns it into
//! the handful of flags the orchestrator acts on, and [`EffectivePlan::next_step`]
//! decides what to do once the cached state is known.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::token::CacheStatus;

pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(3600);

/// How a cached read trades freshness against availability.
///
/// Each variant fixes three choices: whether the entry is invalidated before
/// reading, whether an expired entry may still be delivered, and whether the
/// network is consulted at all. Variants ending in `First` deliver a stale
/// entry immediately and refresh it in the background; `Fallback` variants
/// go to the network and keep the stale entry only for when that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CachePriority {
    #[default]
    StaleAcceptedFirst,
    StaleAcceptedFallback,
    StaleNotAccepted,
    InvalidateStaleAcceptedFirst,
    InvalidateStaleAcceptedFallback,
    InvalidateStaleNotAccepted,
    OfflineStaleAccepted,
    OfflineStaleNotAccepted,
}

impl CachePriority {
    pub fn invalidates(self) -> bool {
        matches!(
            self,
            Self::InvalidateStaleAcceptedFirst
                | Self::InvalidateStaleAcceptedFallback
                | Self::InvalidateStaleNotAccepted
        )
    }

    pub fn accepts_stale(self) -> bool {
        matches!(
            self,
            Self::StaleAcceptedFirst
                | Self::StaleAcceptedFallback
                | Self::InvalidateStaleAcceptedFirst
                | Self::InvalidateStaleAcceptedFallback
                | Self::OfflineStaleAccepted
        )
    }

    pub fn is_offline(self) -> bool {
        matches!(self, Self::OfflineStaleAccepted | Self::OfflineStaleNotAccepted)
    }

    /// Whether a stale entry sends the call to the network before anything is delivered.
    pub fn network_first(self) -> bool {
        matches!(
            self,
            Self::StaleAcceptedFallback
                | Self::StaleNotAccepted
                | Self::InvalidateStaleAcceptedFallback
                | Self::InvalidateStaleNotAccepted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleAcceptedFirst => "stale_accepted_first",
            Self::StaleAcceptedFallback => "stale_accepted_fallback",
            Self::StaleNotAccepted => "stale_not_accepted",
            Self::InvalidateStaleAcceptedFirst => "invalidate_stale_accepted_first",
            Self::InvalidateStaleAcceptedFallback => "invalidate_stale_accepted_fallback",
            Self::InvalidateStaleNotAccepted => "invalidate_stale_not_accepted",
            Self::OfflineStaleAccepted => "offline_stale_accepted",
            Self::OfflineStaleNotAccepted => "offline_stale_not_accepted",
        }
    }
}

impl fmt::Display for CachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call overrides of the global cache defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub duration: Option<Duration>,
    pub encrypt: Option<bool>,
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Cache {
        priority: CachePriority,
        options: CacheOptions,
    },
    /// Invalidate, then fetch. With `fresh_only` a failed fetch delivers nothing.
    Refresh {
        fresh_only: bool,
        options: CacheOptions,
    },
    DoNotCache,
    Invalidate,
    /// Serve from the cache only, never touching the network.
    Offline { fresh_only: bool },
    Clear {
        type_filter: Option<String>,
        stale_only: bool,
    },
}

impl Operation {
    pub fn cache(priority: CachePriority) -> Self {
        Self::Cache {
            priority,
            options: CacheOptions::default(),
        }
    }

    pub fn refresh() -> Self {
        Self::Refresh {
            fresh_only: false,
            options: CacheOptions::default(),
        }
    }

    pub fn offline() -> Self {
        Self::Offline { fresh_only: false }
    }

    pub fn clear_all() -> Self {
        Self::Clear {
            type_filter: None,
            stale_only: false,
        }
    }

    pub fn priority(&self) -> Option<CachePriority> {
        match self {
            Self::Cache { priority, .. } => Some(*priority),
            Self::Refresh { fresh_only, .. } => Some(if *fresh_only {
                CachePriority::InvalidateStaleNotAccepted
            } else {
                CachePriority::InvalidateStaleAcceptedFallback
            }),
            Self::Offline { fresh_only } => Some(if *fresh_only {
                CachePriority::OfflineStaleNotAccepted
            } else {
                CachePriority::OfflineStaleAccepted
            }),
            Self::DoNotCache | Self::Invalidate | Self::Clear { .. } => None,
        }
    }

    pub fn options(&self) -> Option<&CacheOptions> {
        match self {
            Self::Cache { options, .. } | Self::Refresh { options, .. } => Some(options),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cache { .. } => "cache",
            Self::Refresh { .. } => "refresh",
            Self::DoNotCache => "do_not_cache",
            Self::Invalidate => "invalidate",
            Self::Offline { .. } => "offline",
            Self::Clear { .. } => "clear",
        }
    }
}

/// Flags the orchestrator acts on for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectivePlan {
    pub must_invalidate_first: bool,
    pub reads_cache: bool,
    pub accepts_stale: bool,
    pub fetches_network: bool,
    pub network_first: bool,
    pub is_offline_only: bool,
    pub writes_cache: bool,
}

/// What to do once the cached state is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReturnCached,
    ReturnCachedAndRefresh,
    Fetch { fallback_to_cached: bool },
    Empty,
}

impl EffectivePlan {
    pub fn resolve(operation: &Operation) -> Self {
        if let Some(priority) = operation.priority() {
            let fetches_network = !priority.is_offline();
            return Self {
                must_invalidate_first: priority.invalidates(),
                reads_cache: true,
                accepts_stale: priority.accepts_stale(),
                fetches_network,
                network_first: priority.network_first(),
                is_offline_only: priority.is_offline(),
                writes_cache: fetches_network,
            };
        }

        match operation {
            Operation::DoNotCache => Self {
                fetches_network: true,
                network_first: true,
                ..Self::default()
            },
            Operation::Invalidate => Self {
                must_invalidate_first: true,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    /// Runs without a cache read or a network call.
    pub fn is_local_only(&self) -> bool {
        !self.reads_cache && !self.fetches_network
    }

    /// `cached` is the status of the entry read from the store, `None` on a miss.
    pub fn next_step(&self, cached: Option<CacheStatus>) -> Step {
        let miss = if self.fetches_network {
            Step::Fetch {
                fallback_to_cached: false,
            }
        } else {
            Step::Empty
        };

        match cached {
            None => miss,
            Some(CacheStatus::Stale) => {
                if !self.accepts_stale {
                    miss
                } else if !self.fetches_network {
                    Step::ReturnCached
                } else if self.network_first {
                    Step::Fetch {
                        fallback_to_cached: true,
                    }
                } else {
                    Step::ReturnCachedAndRefresh
                }
            }
            Some(_) => Step::ReturnCached,
        }
    }
}

/// Decides the operation for calls that did not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationPredicate {
    /// Calls without an explicit operation bypass the cache entirely.
    #[default]
    Inactive,
    CacheDisabled,
    CacheEverything,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation predicate `{0}` (expected inactive, disabled or everything)")]
pub struct ParsePredicateError(String);

impl FromStr for OperationPredicate {
    type Err = ParsePredicateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inactive" => Ok(Self::Inactive),
            "disabled" => Ok(Self::CacheDisabled),
            "everything" => Ok(Self::CacheEverything),
            _ => Err(ParsePredicateError(value.to_string())),
        }
    }
}

impl OperationPredicate {
    /// An explicit operation always wins. `None` means the call is not routed through the cache.
    pub fn operation_for(
        self,
        explicit: Option<Operation>,
        default_duration: Duration,
    ) -> Option<Operation> {
        if explicit.is_some() {
            return explicit;
        }
        match self {
            Self::Inactive => None,
            Self::CacheDisabled => Some(Operation::DoNotCache),
            Self::CacheEverything => Some(Operation::Cache {
                priority: CachePriority::StaleAcceptedFirst,
                options: CacheOptions {
                    duration: Some(default_duration),
                    ..CacheOptions::default()
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PRIORITIES: [CachePriority; 8] = [
        CachePriority::StaleAcceptedFirst,
        CachePriority::StaleAcceptedFallback,
        CachePriority::StaleNotAccepted,
        CachePriority::InvalidateStaleAcceptedFirst,
        CachePriority::InvalidateStaleAcceptedFallback,
        CachePriority::InvalidateStaleNotAccepted,
        CachePriority::OfflineStaleAccepted,
        CachePriority::OfflineStaleNotAccepted,
    ];

    #[test]
    fn offline_priorities_never_fetch_or_write() {
        for priority in ALL_PRIORITIES {
            let plan = EffectivePlan::resolve(&Operation::cache(priority));
            assert!(plan.reads_cache);
            assert_eq!(plan.fetches_network, !priority.is_offline(), "{priority}");
            assert_eq!(plan.writes_cache, plan.fetches_network, "{priority}");
            assert_eq!(plan.is_offline_only, priority.is_offline(), "{priority}");
        }
    }

    #[test]
    fn refresh_and_offline_map_onto_priorities() {
        assert_eq!(
            Operation::refresh().priority(),
            Some(CachePriority::InvalidateStaleAcceptedFallback)
        );
        let strict = Operation::Refresh {
            fresh_only: true,
            options: CacheOptions::default(),
        };
        assert_eq!(
            strict.priority(),
            Some(CachePriority::InvalidateStaleNotAccepted)
        );
        assert_eq!(
            Operation::Offline { fresh_only: true }.priority(),
            Some(CachePriority::OfflineStaleNotAccepted)
        );
        assert_eq!(Operation::DoNotCache.priority(), None);
    }

    #[test]
    fn local_operations_resolve_without_reads_or_fetches() {
        let invalidate = EffectivePlan::resolve(&Operation::Invalidate);
        assert!(invalidate.must_invalidate_first);
        assert!(invalidate.is_local_only());

        let clear = EffectivePlan::resolve(&Operation::clear_all());
        assert!(clear.is_local_only());
        assert!(!clear.must_invalidate_first);

        let bypass = EffectivePlan::resolve(&Operation::DoNotCache);
        assert!(bypass.fetches_network);
        assert!(!bypass.reads_cache);
        assert!(!bypass.writes_cache);
    }

    #[test]
    fn a_miss_fetches_unless_offline() {
        let online = EffectivePlan::resolve(&Operation::cache(CachePriority::StaleAcceptedFirst));
        assert_eq!(
            online.next_step(None),
            Step::Fetch {
                fallback_to_cached: false
            }
        );
        let offline = EffectivePlan::resolve(&Operation::offline());
        assert_eq!(offline.next_step(None), Step::Empty);
    }

    #[test]
    fn fresh_entries_are_always_returned() {
        for priority in ALL_PRIORITIES {
            let plan = EffectivePlan::resolve(&Operation::cache(priority));
            assert_eq!(
                plan.next_step(Some(CacheStatus::Fresh)),
                Step::ReturnCached,
                "{priority}"
            );
        }
    }

    #[test]
    fn stale_entries_follow_the_priority() {
        let step = |priority| {
            EffectivePlan::resolve(&Operation::cache(priority)).next_step(Some(CacheStatus::Stale))
        };
        assert_eq!(
            step(CachePriority::StaleAcceptedFirst),
            Step::ReturnCachedAndRefresh
        );
        assert_eq!(
            step(CachePriority::InvalidateStaleAcceptedFirst),
            Step::ReturnCachedAndRefresh
        );
        assert_eq!(
            step(CachePriority::StaleAcceptedFallback),
            Step::Fetch {
                fallback_to_cached: true
            }
        );
        assert_eq!(
            step(CachePriority::StaleNotAccepted),
            Step::Fetch {
                fallback_to_cached: false
            }
        );
        assert_eq!(step(CachePriority::OfflineStaleAccepted), Step::ReturnCached);
        assert_eq!(step(CachePriority::OfflineStaleNotAccepted), Step::Empty);
    }

    #[test]
    fn predicate_only_applies_without_an_explicit_operation() {
        let hour = DEFAULT_CACHE_DURATION;
        assert_eq!(OperationPredicate::Inactive.operation_for(None, hour), None);
        assert_eq!(
            OperationPredicate::CacheDisabled.operation_for(None, hour),
            Some(Operation::DoNotCache)
        );
        assert_eq!(
            OperationPredicate::CacheEverything.operation_for(Some(Operation::Invalidate), hour),
            Some(Operation::Invalidate)
        );
        let Some(Operation::Cache { priority, options }) =
            OperationPredicate::CacheEverything.operation_for(None, Duration::from_secs(60))
        else {
            panic!("expected a cache operation");
        };
        assert_eq!(priority, CachePriority::StaleAcceptedFirst);
        assert_eq!(options.duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn predicate_parses_config_values() {
        assert_eq!(
            "Everything".parse::<OperationPredicate>(),
            Ok(OperationPredicate::CacheEverything)
        );
        assert_eq!(
            "disabled".parse::<OperationPredicate>(),
            Ok(OperationPredicate::CacheDisabled)
        );
        assert!("sometimes".parse::<OperationPredicate>().is_err());
    }
}
