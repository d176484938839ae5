//! Reload planning.
//!
//! A reload compares the running configuration with the freshly validated
//! one and touches only the components whose inputs changed.

use crate::config::EffectiveConfig;

/// Which components a reload must touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    pub agent: bool,
    pub server: bool,
    pub client: bool,
    pub listeners: bool,
    /// New log level, when it changed.
    pub log_level: Option<String>,
}

impl ReloadPlan {
    /// `tls_material_changed` reports whether the certificate or key bytes on
    /// disk differ from those the listeners were started with.
    pub fn between(old: &EffectiveConfig, new: &EffectiveConfig, tls_material_changed: bool) -> Self {
        let tls = old.tls != new.tls || tls_material_changed;
        let shared = old.region != new.region
            || old.datacenter != new.datacenter
            || old.name != new.name
            || old.consuls != new.consuls
            || old.vaults != new.vaults
            || old.acl != new.acl;

        let http_bind = old.http_addr().ok() != new.http_addr().ok();

        Self {
            agent: tls,
            server: new.server.is_enabled()
                && (tls || shared || old.server != new.server || old.rpc != new.rpc),
            client: new.client.is_enabled() && (tls || shared || old.client != new.client),
            listeners: tls || http_bind,
            log_level: (!old.log_level().eq_ignore_ascii_case(new.log_level()))
                .then(|| new.log_level().to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
