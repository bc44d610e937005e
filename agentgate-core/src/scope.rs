//! Scope Registry & Expansion
//!
//! Scopes are permission identifiers of the form `resource:action[:qualifier]*`.
//! The registry owns the set of registered scopes and expands a requested set
//! into the permissions it implies.

use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

/// Scope action vocabulary
///
/// Closed enumeration; `Admin` is the maximal element and implies every
/// other action on the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read access
    Read,
    /// Write access (create)
    Write,
    /// Update access (mutate existing)
    Update,
    /// Delete access
    Delete,
    /// Execute access (invoke a tool or job)
    Execute,
    /// Full control over the resource
    Admin,
}

impl Action {
    /// All actions, in declaration order
    pub const ALL: [Action; 6] = [
        Action::Read,
        Action::Write,
        Action::Update,
        Action::Delete,
        Action::Execute,
        Action::Admin,
    ];

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Execute => "execute",
            Action::Admin => "admin",
        }
    }
}

impl FromStr for Action {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "execute" => Ok(Action::Execute),
            "admin" => Ok(Action::Admin),
            other => Err(AuthError::InvalidScope(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed scope name: `resource:action[:qualifier]*`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeName {
    /// Resource segment
    pub resource: String,
    /// Action segment, drawn from the closed [`Action`] enum
    pub action: Action,
    /// Zero or more qualifier segments, most general first
    pub qualifiers: Vec<String>,
}

impl ScopeName {
    /// Parse and validate a scope name against the grammar
    /// `^[a-z]+:(read|write|update|delete|execute|admin)(:[a-z]+)*$`.
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = name.split(':');

        let resource = parts
            .next()
            .filter(|segment| is_lower_alpha(segment))
            .ok_or_else(|| invalid_name(name))?
            .to_string();

        let action = parts
            .next()
            .ok_or_else(|| invalid_name(name))?
            .parse::<Action>()
            .map_err(|_| invalid_name(name))?;

        let mut qualifiers = Vec::new();
        for segment in parts {
            if !is_lower_alpha(segment) {
                return Err(invalid_name(name));
            }
            qualifiers.push(segment.to_string());
        }

        Ok(Self {
            resource,
            action,
            qualifiers,
        })
    }

    /// True when the scope has no qualifier segments
    pub fn is_unqualified(&self) -> bool {
        self.qualifiers.is_empty()
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)?;
        for qualifier in &self.qualifiers {
            write!(f, ":{}", qualifier)?;
        }
        Ok(())
    }
}

fn is_lower_alpha(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase())
}

fn invalid_name(name: &str) -> AuthError {
    AuthError::InvalidScope(format!(
        "scope '{}' does not match resource:action[:qualifier]*",
        name
    ))
}

/// Registered scope record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Scope name, validated against the grammar
    pub name: String,

    /// Grouping category (e.g. "crm", "infra")
    pub category: String,

    /// Sensitive scopes get extra audit detail
    pub sensitive: bool,

    /// Issuance requires human approval regardless of policy outcome
    pub requires_approval: bool,

    /// Granted when a client requests no explicit scope
    pub is_default: bool,

    /// Soft-delete flag; inactive scopes never participate in expansion
    pub active: bool,
}

impl Scope {
    /// Create an active scope with default flags
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            sensitive: false,
            requires_approval: false,
            is_default: false,
            active: true,
        }
    }

    /// Mark as sensitive
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Mark as requiring human approval
    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Mark as a default scope
    pub fn default_scope(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Scope Registry
///
/// Owns registered scopes and implements the expansion algorithm. Scopes are
/// usually registered from a declarative manifest at boot.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: RwLock<HashMap<String, Scope>>,
}

impl ScopeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a scope name against the grammar
    pub fn validate_name(&self, name: &str) -> Result<ScopeName> {
        ScopeName::parse(name)
    }

    /// Register a single scope; the name must satisfy the grammar
    pub fn register(&self, scope: Scope) -> Result<()> {
        ScopeName::parse(&scope.name)?;
        let mut scopes = self.scopes.write().expect("scope registry poisoned");
        scopes.insert(scope.name.clone(), scope);
        Ok(())
    }

    /// Register a manifest of scopes; rejects the whole manifest on the
    /// first invalid name so boot fails loudly rather than partially.
    pub fn register_manifest(&self, manifest: Vec<Scope>) -> Result<usize> {
        for scope in &manifest {
            ScopeName::parse(&scope.name)?;
        }
        let count = manifest.len();
        let mut scopes = self.scopes.write().expect("scope registry poisoned");
        for scope in manifest {
            scopes.insert(scope.name.clone(), scope);
        }
        Ok(count)
    }

    /// Look up a registered scope by name
    pub fn get(&self, name: &str) -> Option<Scope> {
        self.scopes
            .read()
            .expect("scope registry poisoned")
            .get(name)
            .cloned()
    }

    /// Replace an existing scope record
    pub fn update(&self, scope: Scope) -> Result<()> {
        let mut scopes = self.scopes.write().expect("scope registry poisoned");
        if !scopes.contains_key(&scope.name) {
            return Err(AuthError::InvalidScope(format!(
                "scope '{}' is not registered",
                scope.name
            )));
        }
        scopes.insert(scope.name.clone(), scope);
        Ok(())
    }

    /// Soft-delete: deactivate without removing the record
    pub fn deactivate(&self, name: &str) -> Result<()> {
        let mut scopes = self.scopes.write().expect("scope registry poisoned");
        match scopes.get_mut(name) {
            Some(scope) => {
                scope.active = false;
                Ok(())
            }
            None => Err(AuthError::InvalidScope(format!(
                "scope '{}' is not registered",
                name
            ))),
        }
    }

    /// Hard-delete a scope record
    pub fn remove(&self, name: &str) -> Option<Scope> {
        self.scopes
            .write()
            .expect("scope registry poisoned")
            .remove(name)
    }

    /// Names of all active registered scopes
    pub fn active_names(&self) -> Vec<String> {
        self.scopes
            .read()
            .expect("scope registry poisoned")
            .values()
            .filter(|scope| scope.active)
            .map(|scope| scope.name.clone())
            .collect()
    }

    /// Names of all active default scopes
    pub fn default_names(&self) -> Vec<String> {
        self.scopes
            .read()
            .expect("scope registry poisoned")
            .values()
            .filter(|scope| scope.active && scope.is_default)
            .map(|scope| scope.name.clone())
            .collect()
    }

    /// True when any requested scope requires human approval
    pub fn any_requires_approval(&self, requested: &[String]) -> bool {
        let scopes = self.scopes.read().expect("scope registry poisoned");
        requested
            .iter()
            .any(|name| scopes.get(name).is_some_and(|s| s.requires_approval))
    }

    /// Expand a requested scope set into its implied permissions.
    ///
    /// Two implication rules, evaluated against the active registered set:
    ///
    /// 1. An unqualified grant implies all of its registered qualified
    ///    variants: `deals:read` pulls in every registered `deals:read:*`.
    /// 2. `admin` on a resource implies every other registered action on
    ///    that resource with the same qualifiers. An unqualified `admin`
    ///    additionally pulls in every registered scope on the resource, so
    ///    expansion stays idempotent without recursive re-expansion.
    ///
    /// Scopes that do not parse against the grammar (free-form delegation
    /// scopes such as `deals.read`) pass through untouched.
    pub fn expand(&self, requested: &[String]) -> BTreeSet<String> {
        let registered = self.active_names();
        expand_against(requested, &registered)
    }
}

/// Expansion over an explicit registered set; one pass, idempotent.
pub fn expand_against(requested: &[String], registered: &[String]) -> BTreeSet<String> {
    let mut granted: BTreeSet<String> = requested.iter().cloned().collect();

    let parsed_registered: Vec<(String, ScopeName)> = registered
        .iter()
        .filter_map(|name| ScopeName::parse(name).ok().map(|p| (name.clone(), p)))
        .collect();

    for name in requested {
        let Ok(req) = ScopeName::parse(name) else {
            continue;
        };

        for (reg_name, reg) in &parsed_registered {
            if reg.resource != req.resource {
                continue;
            }

            // Rule 1: unqualified grant implies registered qualified variants.
            if req.is_unqualified() && reg.action == req.action && !reg.is_unqualified() {
                granted.insert(reg_name.clone());
            }

            // Rule 2: admin implies every other action on the same
            // resource+qualifiers; unqualified admin covers the whole
            // resource so the result is a fixpoint.
            if req.action == Action::Admin {
                let qualifier_match = if req.is_unqualified() {
                    true
                } else {
                    reg.qualifiers == req.qualifiers
                };
                if qualifier_match && reg.action != Action::Admin {
                    granted.insert(reg_name.clone());
                }
            }
        }
    }

    granted
}
