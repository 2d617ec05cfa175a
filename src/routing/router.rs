//! Location lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::routing::matcher::{Matcher, PathPrefixMatcher};
use crate::upstream::request::RequestTemplate;

/// A compiled backend engine.
#[derive(Debug, Clone)]
pub struct Engine {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub template: RequestTemplate,
}

/// A compiled location.
#[derive(Debug, Clone)]
pub struct Location {
    pub prefix: String,
    /// Engine name as configured.
    pub engine_name: String,
    /// `None` when the name does not refer to a usable engine.
    pub engine: Option<Arc<Engine>>,
}

/// Immutable location table.
#[derive(Debug, Default)]
pub struct Router {
    locations: Vec<(PathPrefixMatcher, Location)>,
}

impl Router {
    /// Compile locations and engines from config.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let mut engines: HashMap<String, Arc<Engine>> = HashMap::new();
        for engine in &config.upstream.engines {
            match RequestTemplate::new(&engine.target, &engine.host, engine.port) {
                Ok(template) => {
                    engines.insert(
                        engine.name.to_ascii_lowercase(),
                        Arc::new(Engine {
                            name: engine.name.clone(),
                            host: engine.host.clone(),
                            port: engine.port,
                            template,
                        }),
                    );
                }
                Err(e) => {
                    tracing::warn!(engine = %engine.name, error = %e, "Skipping unusable engine");
                }
            }
        }

        let mut locations: Vec<(PathPrefixMatcher, Location)> = config
            .locations
            .iter()
            .map(|location| {
                let engine_name = location
                    .search_engine
                    .clone()
                    .unwrap_or_else(|| config.upstream.default_engine.clone());
                let engine = engines.get(&engine_name.to_ascii_lowercase()).cloned();
                (
                    PathPrefixMatcher::new(location.path_prefix.clone()),
                    Location {
                        prefix: location.path_prefix.clone(),
                        engine_name,
                        engine,
                    },
                )
            })
            .collect();

        // Stable sort keeps config order among equal-length prefixes.
        locations.sort_by(|(a, _), (b, _)| b.specificity().cmp(&a.specificity()));

        tracing::debug!(locations = locations.len(), engines = engines.len(), "Router compiled");
        Self { locations }
    }

    /// Find the most specific location covering `path`.
    pub fn match_path(&self, path: &str) -> Option<&Location> {
        self.locations
            .iter()
            .find(|(matcher, _)| matcher.matches(path))
            .map(|(_, location)| location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, LocationConfig};

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.locations = vec![
            LocationConfig {
                path_prefix: "/".to_string(),
                search_engine: None,
            },
            LocationConfig {
                path_prefix: "/baidu".to_string(),
                search_engine: Some("Baidu".to_string()),
            },
            LocationConfig {
                path_prefix: "/ghost".to_string(),
                search_engine: Some("ghost".to_string()),
            },
        ];
        config
    }

    #[test]
    fn longest_prefix_wins() {
        let router = Router::from_config(&config());
        let location = router.match_path("/baidu/x").unwrap();
        assert_eq!(location.prefix, "/baidu");
        assert_eq!(location.engine.as_ref().unwrap().host, "www.baidu.com");

        let location = router.match_path("/other").unwrap();
        assert_eq!(location.prefix, "/");
        assert_eq!(location.engine.as_ref().unwrap().name, "bing");
    }

    #[test]
    fn unknown_engine_is_kept_unresolved() {
        let router = Router::from_config(&config());
        let location = router.match_path("/ghost").unwrap();
        assert_eq!(location.engine_name, "ghost");
        assert!(location.engine.is_none());
    }

    #[test]
    fn no_match_without_root() {
        let mut config = config();
        config.locations.retain(|l| l.path_prefix != "/");
        let router = Router::from_config(&config);
        assert!(router.match_path("/images").is_none());
    }

    #[test]
    fn invalid_template_disables_engine() {
        let mut config = config();
        config.upstream.engines.push(EngineConfig {
            name: "ghost".to_string(),
            host: "example.com".to_string(),
            port: 80,
            target: "relative".to_string(),
        });
        let router = Router::from_config(&config);
        assert!(router.match_path("/ghost").unwrap().engine.is_none());
    }
}
