//! Path Router
//!
//! Declared mappings are resolved once, in declared order, into proxy handlers
//! and registered with the gateway's route table. A mapping with a filter is
//! pointed at the filter's loopback port and the filter gets the mapping's
//! declared backend as its upstream.
//!
//! Route patterns use `{name}` for one segment and `{*name}` for the rest of
//! the path. `<name>` and `<path:name>` are accepted as aliases.

use crate::error::{GateError, GateResult};
use crate::filter::{FilterSpec, FilterSupervisor};
use crate::net::wait_for_port;
use crate::pool::ConnectionPool;
use crate::proxy::{ForwardTarget, ProxyHandler};
use hyper::Method;
use matchit::{InsertError, Router as MatchitRouter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Loopback address filters listen on
pub const FILTER_HOST: &str = "127.0.0.1";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_target_path() -> String {
    "/".to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

/// One declared path mapping
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MappingConfig {
    /// Public route pattern
    pub route: String,

    /// Backend port
    pub port: u16,

    /// Backend host
    #[serde(default = "default_host")]
    pub host: String,

    /// Base path on the backend the captured suffix is appended to
    #[serde(default = "default_target_path")]
    pub path: String,

    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub filter: Option<FilterSpec>,
}

impl MappingConfig {
    pub fn new(route: impl Into<String>, port: u16) -> Self {
        Self {
            route: route.into(),
            port,
            host: default_host(),
            path: default_target_path(),
            methods: default_methods(),
            filter: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Methods as parsed HTTP verbs, upper-cased
    pub fn parsed_methods(&self) -> GateResult<Vec<Method>> {
        self.methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    GateError::Configuration(format!("mapping '{}': invalid method '{}'", self.route, m))
                })
            })
            .collect()
    }

    pub fn validate(&self) -> GateResult<()> {
        let mut errors = Vec::new();

        if !self.route.starts_with('/') {
            errors.push(format!("route must start with '/', got '{}'", self.route));
        }
        if self.port == 0 {
            errors.push("port must be a positive integer".to_string());
        }
        if self.host.trim().is_empty() {
            errors.push("host must not be empty".to_string());
        }
        if self.methods.is_empty() {
            errors.push("methods must not be empty".to_string());
        } else if let Err(e) = self.parsed_methods() {
            errors.push(e.to_string());
        }
        if let Some(filter) = &self.filter {
            if let Err(e) = filter.parse_entrypoint() {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GateError::Configuration(format!(
                "mapping '{}': {}",
                self.route,
                errors.join("; ")
            )))
        }
    }
}

/// Translate `<name>` and `<path:name>` segments into router syntax
pub fn normalize_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        out.push_str(&rest[..start]);
        let inner = &rest[start + 1..start + len];
        match inner.split_once(':') {
            Some(("path", name)) => out.push_str(&format!("{{*{}}}", name)),
            Some((_, name)) => out.push_str(&format!("{{{}}}", name)),
            None => out.push_str(&format!("{{{}}}", inner)),
        }
        rest = &rest[start + len + 1..];
    }

    out.push_str(rest);
    out
}

/// Name of the catch-all parameter in a normalized pattern
fn catch_all_param(pattern: &str) -> Option<String> {
    let start = pattern.find("{*")? + 2;
    let len = pattern[start..].find('}')?;
    Some(pattern[start..start + len].to_string())
}

/// What a matched route does
#[derive(Clone)]
pub enum RouteAction {
    Info,
    Files,
    Solved,
    Proxy(ProxyHandler),
}

impl fmt::Debug for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteAction::Info => f.write_str("Info"),
            RouteAction::Files => f.write_str("Files"),
            RouteAction::Solved => f.write_str("Solved"),
            RouteAction::Proxy(handler) => write!(f, "Proxy({})", handler.target()),
        }
    }
}

#[derive(Debug)]
pub struct Route {
    pub pattern: String,
    pub action: RouteAction,
    capture: Option<String>,
}

/// Result of looking up a request
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found {
        route: &'a Route,
        /// Path captured by the route's catch-all segment
        captured: Option<String>,
    },
    MethodNotAllowed,
    NotFound,
}

/// Hook the router registers handlers through
pub trait RouteRegistrar {
    fn register(&mut self, pattern: &str, methods: &[Method], action: RouteAction) -> GateResult<()>;
}

/// Method-aware route table, one radix tree per method
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<Method, MatchitRouter<Arc<Route>>>,
    registered: Vec<(Method, String)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one route. Returns `false` when an identical pattern is already
    /// registered for `method`; the earlier route is kept.
    pub fn insert(&mut self, method: Method, pattern: &str, action: RouteAction) -> GateResult<bool> {
        let pattern = normalize_pattern(pattern);
        let route = Arc::new(Route {
            capture: catch_all_param(&pattern),
            pattern: pattern.clone(),
            action,
        });

        match self.routes.entry(method.clone()).or_default().insert(pattern.as_str(), route) {
            Ok(()) => {
                debug!(%method, pattern = %pattern, "Route registered");
                self.registered.push((method, pattern));
                Ok(true)
            }
            Err(InsertError::Conflict { with }) => {
                warn!(%method, pattern = %pattern, existing = %with, "Route already registered, keeping the first");
                Ok(false)
            }
            Err(e) => Err(GateError::Configuration(format!("invalid route '{}': {}", pattern, e))),
        }
    }

    pub fn lookup(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        if let Some(matched) = self.routes.get(method).and_then(|tree| tree.at(path).ok()) {
            let route: &Route = matched.value;
            let captured = route
                .capture
                .as_deref()
                .and_then(|name| matched.params.get(name))
                .map(str::to_string);
            return RouteMatch::Found { route, captured };
        }

        let other_method_matches = self
            .routes
            .iter()
            .any(|(m, tree)| m != method && tree.at(path).is_ok());
        if other_method_matches {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    /// Registered `(method, pattern)` pairs in registration order
    pub fn registered(&self) -> &[(Method, String)] {
        &self.registered
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

impl RouteRegistrar for RouteTable {
    fn register(&mut self, pattern: &str, methods: &[Method], action: RouteAction) -> GateResult<()> {
        for method in methods {
            self.insert(method.clone(), pattern, action.clone())?;
        }
        Ok(())
    }
}

/// Where one mapping ended up
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub route: String,
    pub methods: Vec<Method>,
    /// Effective forwarding target
    pub target: ForwardTarget,
    /// Port of the filter in front of the backend, if any
    pub filter_port: Option<u16>,
}

/// Resolve every mapping and register its handler, in declared order.
///
/// Filter launch failures abort resolution: a filtered route never falls back
/// to its raw backend.
pub async fn resolve_and_register<R: RouteRegistrar + ?Sized>(
    mappings: &[MappingConfig],
    supervisor: &FilterSupervisor,
    registrar: &mut R,
    pool: &Arc<ConnectionPool>,
) -> GateResult<Vec<ResolvedRoute>> {
    let mut resolved = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        mapping.validate()?;
        let methods = mapping.parsed_methods()?;

        let (target, filter_port) = match &mapping.filter {
            Some(spec) => {
                let listen_port = supervisor.start_filter(spec, &mapping.host, mapping.port)?;
                if let Some(timeout) = spec.ready_timeout() {
                    if !wait_for_port(FILTER_HOST, listen_port, timeout).await {
                        warn!(route = %mapping.route, listen_port, "Filter not accepting connections yet");
                    }
                }
                (
                    ForwardTarget::new(FILTER_HOST, listen_port, mapping.path.clone()),
                    Some(listen_port),
                )
            }
            None => (
                ForwardTarget::new(mapping.host.clone(), mapping.port, mapping.path.clone()),
                None,
            ),
        };

        info!(
            route = %mapping.route,
            methods = ?mapping.methods,
            target = %target,
            filtered = filter_port.is_some(),
            "Mapping resolved"
        );

        let handler = ProxyHandler::new(target.clone(), Arc::clone(pool));
        registrar.register(&mapping.route, &methods, RouteAction::Proxy(handler))?;

        resolved.push(ResolvedRoute {
            route: mapping.route.clone(),
            methods,
            target,
            filter_port,
        });
    }

    Ok(resolved)
}
