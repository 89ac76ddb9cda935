//! Request classification.
//!
//! Rules are evaluated in order and the first match wins. Requests matching
//! no rule are `Dynamic`; `PassThrough` marks requests that are never cached.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::http::Request;

/// Resource class assigned to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceClass {
  Image,
  Static,
  CriticalApi,
  CacheableApi,
  Dynamic,
  /// Uncacheable; always goes straight to the network
  PassThrough,
}

/// A single classification rule as written in configuration.
///
/// Exactly one of the predicate fields must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
  /// Path starts with this prefix
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prefix: Option<String>,
  /// Path matches this regular expression
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pattern: Option<String>,
  /// Last path segment has one of these extensions (case-insensitive)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extensions: Option<Vec<String>>,
  /// Accept header starts with this media-type prefix
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accept: Option<String>,
  pub class: ResourceClass,
}

impl ClassificationRule {
  fn empty(class: ResourceClass) -> Self {
    Self {
      prefix: None,
      pattern: None,
      extensions: None,
      accept: None,
      class,
    }
  }

  pub fn prefix(prefix: &str, class: ResourceClass) -> Self {
    Self {
      prefix: Some(prefix.to_string()),
      ..Self::empty(class)
    }
  }

  pub fn pattern(pattern: &str, class: ResourceClass) -> Self {
    Self {
      pattern: Some(pattern.to_string()),
      ..Self::empty(class)
    }
  }

  pub fn extensions(extensions: &[&str], class: ResourceClass) -> Self {
    Self {
      extensions: Some(extensions.iter().map(|e| e.to_string()).collect()),
      ..Self::empty(class)
    }
  }

  pub fn accept(media_prefix: &str, class: ResourceClass) -> Self {
    Self {
      accept: Some(media_prefix.to_string()),
      ..Self::empty(class)
    }
  }
}

/// The built-in rule set: critical API records, cacheable API lookups, other
/// API calls uncached, then images, build artifacts and static assets.
pub fn default_rules() -> Vec<ClassificationRule> {
  use ResourceClass::*;

  vec![
    ClassificationRule::pattern(r"^/api/patients/[^/]+/?$", CriticalApi),
    ClassificationRule::pattern(r"^/api/emergency(/|$)", CriticalApi),
    ClassificationRule::pattern(r"^/api/vitals(/|$)", CriticalApi),
    ClassificationRule::pattern(
      r"^/api/(symptoms|conditions|pharmacies|medications|profile)(/|$)",
      CacheableApi,
    ),
    ClassificationRule::prefix("/api/", PassThrough),
    ClassificationRule::extensions(
      &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"],
      Image,
    ),
    ClassificationRule::accept("image/", Image),
    ClassificationRule::extensions(&["js", "mjs", "css", "woff", "woff2", "ttf", "otf"], Static),
    ClassificationRule::prefix("/static/", Static),
  ]
}

#[derive(Debug)]
enum Matcher {
  Prefix(String),
  Pattern(Regex),
  Extension(Vec<String>),
  Accept(String),
}

impl Matcher {
  fn compile(rule: &ClassificationRule) -> Result<Self> {
    let mut matchers = Vec::new();

    if let Some(prefix) = &rule.prefix {
      matchers.push(Matcher::Prefix(prefix.clone()));
    }
    if let Some(pattern) = &rule.pattern {
      let regex = Regex::new(pattern)
        .map_err(|e| RelayError::InvalidRule(format!("bad pattern '{}': {}", pattern, e)))?;
      matchers.push(Matcher::Pattern(regex));
    }
    if let Some(extensions) = &rule.extensions {
      let extensions = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();
      matchers.push(Matcher::Extension(extensions));
    }
    if let Some(accept) = &rule.accept {
      matchers.push(Matcher::Accept(accept.to_lowercase()));
    }

    match matchers.len() {
      1 => Ok(matchers.remove(0)),
      0 => Err(RelayError::InvalidRule(format!(
        "rule for {:?} has no predicate",
        rule.class
      ))),
      _ => Err(RelayError::InvalidRule(format!(
        "rule for {:?} has more than one predicate",
        rule.class
      ))),
    }
  }

  fn matches(&self, path: &str, request: &Request) -> bool {
    match self {
      Matcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
      Matcher::Pattern(regex) => regex.is_match(path),
      Matcher::Extension(extensions) => extension_of(path)
        .map(|ext| extensions.iter().any(|e| *e == ext))
        .unwrap_or(false),
      Matcher::Accept(media) => request
        .header("accept")
        .map(|a| a.trim().to_lowercase().starts_with(media.as_str()))
        .unwrap_or(false),
    }
  }
}

/// Lowercased extension of the last path segment, if any.
fn extension_of(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_lowercase())
}

/// Maps requests to resource classes using an ordered rule list.
#[derive(Debug)]
pub struct Classifier {
  rules: Vec<(Matcher, ResourceClass)>,
}

impl Classifier {
  /// Compile the rules. Fails on an invalid regex or a malformed rule.
  pub fn new(rules: &[ClassificationRule]) -> Result<Self> {
    let rules = rules
      .iter()
      .map(|rule| Ok((Matcher::compile(rule)?, rule.class)))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { rules })
  }

  pub fn classify(&self, request: &Request) -> ResourceClass {
    let path = request.url.path();
    self
      .rules
      .iter()
      .find(|(matcher, _)| matcher.matches(path, request))
      .map(|(_, class)| *class)
      .unwrap_or(ResourceClass::Dynamic)
  }
}
