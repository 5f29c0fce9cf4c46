//! Route Resolution
//!
//! Maps an HTTP method and a request path back to the contract operation
//! that declares it.

use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

use super::{join_paths, Contract, HttpMethod};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("No route matches {method} {path}")]
    NotFound { method: HttpMethod, path: String },

    #[error("Malformed path template '{template}': {reason}")]
    MalformedTemplate { template: String, reason: String },
}

/// A resolved route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub method: HttpMethod,
    /// Path template exactly as declared in the contract (the `paths` key)
    pub template: String,
    /// Values captured for each `{name}` placeholder
    pub path_params: BTreeMap<String, String>,
}

/// Resolves (method, path) pairs against the contract
pub trait RouteResolver: Send + Sync {
    fn find_route(&self, method: HttpMethod, path: &str) -> Result<RouteMatch, RouteError>;
}

struct CompiledRoute {
    method: HttpMethod,
    template: String,
    matcher: Regex,
    params: Vec<String>,
}

/// Regex-backed route table
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    /// Compile every declared operation under the contract's base path
    pub fn new(contract: &Contract) -> Result<Self, RouteError> {
        let base_path = contract.base_path();
        let mut routes = Vec::new();

        for (template, method, _) in contract.operations() {
            let full = join_paths(&base_path, template);
            let (pattern, params) = compile_template(&full).map_err(|reason| {
                RouteError::MalformedTemplate {
                    template: template.to_string(),
                    reason,
                }
            })?;
            let matcher = Regex::new(&pattern).map_err(|e| RouteError::MalformedTemplate {
                template: template.to_string(),
                reason: e.to_string(),
            })?;
            routes.push(CompiledRoute {
                method,
                template: template.to_string(),
                matcher,
                params,
            });
        }

        // Literal routes win over templated ones
        routes.sort_by_key(|route| route.params.len());

        Ok(Self { routes })
    }

    /// Number of compiled routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteResolver for Router {
    fn find_route(&self, method: HttpMethod, path: &str) -> Result<RouteMatch, RouteError> {
        for route in self.routes.iter().filter(|r| r.method == method) {
            if let Some(captures) = route.matcher.captures(path) {
                let path_params = route
                    .params
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, name)| {
                        captures
                            .get(idx + 1)
                            .map(|m| (name.clone(), m.as_str().to_string()))
                    })
                    .collect();
                return Ok(RouteMatch {
                    method,
                    template: route.template.clone(),
                    path_params,
                });
            }
        }

        Err(RouteError::NotFound {
            method,
            path: path.to_string(),
        })
    }
}

/// Turn `/a/{id}/b` into `^/a/([^/]+)/b/?$` plus the ordered placeholder names
fn compile_template(template: &str) -> Result<(String, Vec<String>), String> {
    let mut pattern = String::from("^");
    let mut params = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find(['{', '}']) {
        if rest.as_bytes()[open] == b'}' {
            return Err("unbalanced '}'".to_string());
        }
        pattern.push_str(&regex::escape(&rest[..open]));
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| "unterminated '{'".to_string())?;
        let name = &after[..close];
        if name.is_empty() {
            return Err("empty placeholder name".to_string());
        }
        if name.contains('{') {
            return Err("nested '{'".to_string());
        }
        params.push(name.to_string());
        pattern.push_str("([^/]+)");
        rest = &after[close + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    if !pattern.ends_with('/') {
        pattern.push_str("/?");
    }
    pattern.push('$');

    Ok((pattern, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract() -> Contract {
        Contract::from_document(json!({
            "openapi": "3.0.0",
            "servers": [{"url": "http://localhost/api"}],
            "paths": {
                "/items/{id}": {"get": {}, "delete": {}},
                "/items/latest": {"get": {}},
                "/orgs/{org}/repos/{repo}": {"get": {}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_literal_route_wins() {
        let router = Router::new(&contract()).unwrap();
        let found = router.find_route(HttpMethod::Get, "/api/items/latest").unwrap();
        assert_eq!(found.template, "/items/latest");
        assert!(found.path_params.is_empty());
    }

    #[test]
    fn test_templated_route_captures() {
        let router = Router::new(&contract()).unwrap();
        let found = router
            .find_route(HttpMethod::Get, "/api/orgs/acme/repos/widgets")
            .unwrap();
        assert_eq!(found.template, "/orgs/{org}/repos/{repo}");
        assert_eq!(found.path_params["org"], "acme");
        assert_eq!(found.path_params["repo"], "widgets");
    }

    #[test]
    fn test_template_path_matches_itself() {
        let router = Router::new(&contract()).unwrap();
        let found = router.find_route(HttpMethod::Delete, "/api/items/{id}").unwrap();
        assert_eq!(found.template, "/items/{id}");
    }

    #[test]
    fn test_method_and_base_path_must_match() {
        let router = Router::new(&contract()).unwrap();
        assert!(router.find_route(HttpMethod::Post, "/api/items/1").is_err());
        assert!(router.find_route(HttpMethod::Get, "/items/1").is_err());
    }

    #[test]
    fn test_malformed_templates() {
        assert!(compile_template("/a/{id").is_err());
        assert!(compile_template("/a/}id{").is_err());
        assert!(compile_template("/a/{}").is_err());
        assert!(compile_template("/a/{b{c}}").is_err());
    }
}
