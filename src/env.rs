/*!
Environment inheritance for CGI subprocesses.

- The host environment is filtered once at startup: CGI meta-variables and
  dynamic-loader knobs never leak from the host into a script, and neither
  does anything starting with `HTTP`.
- The per-request environment is the request parameters followed by the
  filtered host entries whose names the request did not already set.
*/
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};

use once_cell::sync::Lazy;

use crate::gateway::Params;

/// Names that must only ever come from the current request (CGI meta-variables)
/// or that influence the dynamic loader.
pub const DENIED_INHERIT_NAMES: &[&str] = &[
    "AUTH_TYPE",
    "CONTENT_LENGTH",
    "CONTENT_TYPE",
    "GATEWAY_INTERFACE",
    "PATH_INFO",
    "PATH_TRANSLATED",
    "QUERY_STRING",
    "REMOTE_ADDR",
    "REMOTE_HOST",
    "REMOTE_IDENT",
    "REMOTE_USER",
    "REQUEST_METHOD",
    "SCRIPT_NAME",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_PROTOCOL",
    "SERVER_SOFTWARE",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_DEBUG",
    "LD_DYNAMIC_WEAK",
    "LD_BIND_NOW",
    "LD_ORIGIN_PATH",
    "LD_ASSUME_KERNEL",
    "LD_CONFIG_FILE",
];

static DENIED: Lazy<HashSet<&'static str>> =
    Lazy::new(|| DENIED_INHERIT_NAMES.iter().copied().collect());

/// Prefix of request-header derived variables.
const HTTP_PREFIX: &str = "HTTP";

/// Return true if a host variable with this name may be passed to scripts.
pub fn is_inheritable(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    !(name.starts_with(HTTP_PREFIX) || DENIED.contains(name.as_ref()))
}

/// Filtered host environment, computed once at startup.
#[derive(Debug, Clone, Default)]
pub struct InheritedEnv {
    vars: Vec<(OsString, OsString)>,
}

impl InheritedEnv {
    /// Filter the current process environment.
    pub fn from_host() -> Self {
        Self::from_vars(std::env::vars_os())
    }

    /// Filter an arbitrary set of host variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| is_inheritable(k))
            .collect();
        InheritedEnv { vars }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }
}

/// Final environment for one subprocess: ordered, no duplicate names.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSet {
    entries: Vec<(OsString, OsString)>,
}

impl EnvironmentSet {
    /// Merge request parameters (high priority) with the inherited set.
    pub fn merge(params: &Params, inherited: &InheritedEnv) -> Self {
        let mut seen: HashSet<OsString> = HashSet::with_capacity(params.len() + inherited.len());
        let mut entries = Vec::with_capacity(params.len() + inherited.len());

        // Sorted so the resulting order does not depend on HashMap iteration.
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        for k in keys {
            let name = OsString::from(k);
            if seen.insert(name.clone()) {
                entries.push((name, OsString::from(&params[k])));
            }
        }
        for (k, v) in inherited.iter() {
            if seen.insert(k.to_os_string()) {
                entries.push((k.to_os_string(), v.to_os_string()));
            }
        }
        EnvironmentSet { entries }
    }

    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// `NAME=VALUE` rendering (lossy), mainly for diagnostics.
    pub fn to_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect()
    }
}
