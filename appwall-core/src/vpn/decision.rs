//! Policy Decision Engine
//!
//! Combines the owner identity, the per-app/system/default policies,
//! multicast and DNS special cases, and the preflight prober into one
//! decision per packet. Nothing is kept between packets except what the
//! caches hold.
//!
//! Layers, first match wins:
//! 1. Explicit per-app policy (ALLOW/BLOCK)
//! 2. Global default, replaced by the system-apps policy for system apps
//!    when the default is not ALLOW
//! 3. Multicast/broadcast and DNS overrides (never turn ALLOW into BLOCK)
//! 4. Preflight for BLOCK on plaintext HTTP ports

use super::ip_header::IpPacketHeader;
use super::owner_resolver::OwnerResolver;
use super::policy_cache::PolicyCache;
use super::preflight::PreflightProber;
use super::Policy;
use crate::apps::{AppIdentityCache, ApplicationIdentity};
use crate::notification::NotificationSink;
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Final forwarding outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block,
}

impl Verdict {
    pub fn as_policy(self) -> Policy {
        match self {
            Self::Allow => Policy::Allow,
            Self::Block => Policy::Block,
        }
    }
}

/// Result of [`DecisionEngine::decide`]. `policy` may still be `Default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub policy: Policy,
    pub app: Arc<ApplicationIdentity>,
}

impl Decision {
    /// Collapse to ALLOW/BLOCK; `Default` follows the global default.
    pub fn resolve(&self, global_default: Policy) -> Verdict {
        match self.policy {
            Policy::Allow => Verdict::Allow,
            Policy::Block => Verdict::Block,
            Policy::Default if global_default == Policy::Block => Verdict::Block,
            Policy::Default => Verdict::Allow,
        }
    }
}

pub struct DecisionEngine {
    policies: Arc<PolicyCache>,
    resolver: OwnerResolver,
    apps: Arc<AppIdentityCache>,
    prober: Option<Arc<PreflightProber>>,
    notifier: Arc<dyn NotificationSink>,
}

impl DecisionEngine {
    pub fn new(
        policies: Arc<PolicyCache>,
        resolver: OwnerResolver,
        apps: Arc<AppIdentityCache>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            policies,
            resolver,
            apps,
            prober: None,
            notifier,
        }
    }

    pub fn with_prober(mut self, prober: Arc<PreflightProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn unknown_app(&self) -> Arc<ApplicationIdentity> {
        self.apps.unknown()
    }

    /// Decide and collapse to a verdict against the current global default
    pub fn verdict(&self, header: &IpPacketHeader) -> (Decision, Verdict) {
        let decision = self.decide(header);
        let verdict = decision.resolve(self.policies.default_policy());
        (decision, verdict)
    }

    pub fn decide(&self, header: &IpPacketHeader) -> Decision {
        if !header.protocol.is_tcp_or_udp() {
            return self.unknown(Policy::Default);
        }

        match self.resolve_owner(header) {
            Some(uid) => self.decide_for_app(header, self.apps.identity_for_uid(uid)),
            None => self.decide_for_unknown(header),
        }
    }

    fn resolve_owner(&self, header: &IpPacketHeader) -> Option<u32> {
        catch_unwind(AssertUnwindSafe(|| self.resolver.resolve_owner_uid(header))).unwrap_or_else(|_| {
            warn!("Owner lookup panicked for {} -> {}", header.source, header.destination);
            None
        })
    }

    fn decide_for_app(&self, header: &IpPacketHeader, app: Arc<ApplicationIdentity>) -> Decision {
        let per_app = self.policies.effective_policy(&app.package_name);
        if per_app.is_explicit() {
            return Decision { policy: per_app, app };
        }

        let global = self.policies.default_policy();
        let mut effective = global;
        if global != Policy::Allow && app.is_system {
            let system = self.policies.system_apps_policy();
            if system.is_explicit() {
                effective = system;
            }
        }
        effective = self.apply_special_overrides(header, effective, global);

        match effective {
            Policy::Allow => {
                if !self.notification_suppressed(header, global) {
                    self.notifier
                        .post_policy_notification(&app, Policy::Allow, header.destination);
                }
                Decision {
                    policy: Policy::Allow,
                    app,
                }
            }
            _ => self.decide_block(header, app),
        }
    }

    fn decide_block(&self, header: &IpPacketHeader, app: Arc<ApplicationIdentity>) -> Decision {
        if let Some(prober) = &self.prober {
            if prober.is_probe_port(header.destination.port()) {
                let outcome = prober.probe(header.destination);
                if outcome.is_trusted() {
                    debug!(
                        "{} -> {} allowed by preflight",
                        app.package_name, header.destination
                    );
                    self.notifier
                        .post_policy_notification(&app, Policy::Allow, header.destination);
                    return Decision {
                        policy: Policy::Allow,
                        app,
                    };
                }
                // The prober posts the "preflight failed" notification itself
                return Decision {
                    policy: Policy::Block,
                    app,
                };
            }
        }

        self.notifier
            .post_policy_notification(&app, Policy::Block, header.destination);
        Decision {
            policy: Policy::Block,
            app,
        }
    }

    fn decide_for_unknown(&self, header: &IpPacketHeader) -> Decision {
        let global = self.policies.default_policy();
        let policy = self.apply_special_overrides(header, Policy::Default, global);
        self.unknown(policy)
    }

    /// Multicast/broadcast, then DNS. Either one yields ALLOW unless the
    /// global default is BLOCK and the matching switch is off; an ALLOW
    /// going in always stays ALLOW.
    fn apply_special_overrides(&self, header: &IpPacketHeader, current: Policy, global: Policy) -> Policy {
        let mut policy = current;
        if header.is_multicast_or_broadcast() {
            policy = dominant_allow(policy, global, self.policies.allow_multicast());
        }
        if header.is_dns() {
            policy = dominant_allow(policy, global, self.policies.allow_dns());
        }
        policy
    }

    /// Hide flags only apply while the global default is ALLOW
    fn notification_suppressed(&self, header: &IpPacketHeader, global: Policy) -> bool {
        if global != Policy::Allow {
            return false;
        }
        (header.is_multicast_or_broadcast() && self.policies.hide_multicast_notification())
            || (header.is_dns() && self.policies.hide_dns_notification())
    }

    fn unknown(&self, policy: Policy) -> Decision {
        Decision {
            policy,
            app: self.apps.unknown(),
        }
    }
}

fn dominant_allow(current: Policy, global: Policy, switch_on: bool) -> Policy {
    if current == Policy::Allow {
        return Policy::Allow;
    }
    if global == Policy::Block && !switch_on {
        Policy::Block
    } else {
        Policy::Allow
    }
}
