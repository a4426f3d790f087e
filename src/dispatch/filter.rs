use crate::config::FilterConfig;
use crate::source::op::Namespace;
use regex::Regex;

/// Include/exclude patterns over `database.collection`.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NamespaceFilter {
    pub fn from_config(config: &FilterConfig) -> Result<Self, regex::Error> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, regex::Error> {
            patterns.iter().map(|p| Regex::new(p)).collect()
        };
        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
        })
    }

    /// An empty include list admits everything; exclusion wins.
    pub fn matches(&self, ns: &Namespace) -> bool {
        let name = ns.to_string();
        if self.exclude.iter().any(|re| re.is_match(&name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> NamespaceFilter {
        NamespaceFilter::from_config(&FilterConfig {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_empty_filter_admits_all() {
        assert!(filter(&[], &[]).matches(&Namespace::new("any", "thing")));
    }

    #[test]
    fn test_include_and_exclude() {
        let f = filter(&[r"^shop\."], &[r"\.audit$"]);
        assert!(f.matches(&Namespace::new("shop", "orders")));
        assert!(!f.matches(&Namespace::new("shop", "audit")));
        assert!(!f.matches(&Namespace::new("admin", "users")));
    }

    #[test]
    fn test_database_drop_matches_on_database_name() {
        let f = filter(&[r"^shop$"], &[]);
        assert!(f.matches(&Namespace::database_only("shop")));
    }

    #[test]
    fn test_invalid_pattern() {
        let config = FilterConfig {
            include: vec!["(".into()],
            exclude: vec![],
        };
        assert!(NamespaceFilter::from_config(&config).is_err());
    }
}
