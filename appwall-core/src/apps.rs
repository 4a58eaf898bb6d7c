//! Application identities
//!
//! Maps a socket owner uid to the [`ApplicationIdentity`] policies are keyed
//! by. Lookups go to an [`AppDirectory`] once per uid and are cached for the
//! life of the process.

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub const UNKNOWN_PACKAGE: &str = "Unknown";
pub const ROOT_PACKAGE: &str = "Root";
pub const SYSTEM_PACKAGE: &str = "System";

const ROOT_UID: u32 = 0;
/// uids below this are service accounts
const FIRST_REGULAR_UID: u32 = 1000;

/// Who owns a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationIdentity {
    pub package_name: String,
    pub display_label: String,
    pub is_system: bool,
}

impl ApplicationIdentity {
    pub fn new(package_name: impl Into<String>, display_label: impl Into<String>, is_system: bool) -> Self {
        Self {
            package_name: package_name.into(),
            display_label: display_label.into(),
            is_system,
        }
    }

    /// Owner could not be resolved
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_PACKAGE, UNKNOWN_PACKAGE, false)
    }

    pub fn root() -> Self {
        Self::new(ROOT_PACKAGE, ROOT_PACKAGE, true)
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_PACKAGE, SYSTEM_PACKAGE, true)
    }

    /// Resolved uid with no directory entry
    pub fn for_uid(uid: u32) -> Self {
        let name = format!("uid:{}", uid);
        Self::new(name.clone(), name, false)
    }

    pub fn is_unknown(&self) -> bool {
        self.package_name == UNKNOWN_PACKAGE
    }
}

/// Source of installed application metadata
pub trait AppDirectory: Send + Sync {
    /// Identity for `uid`, or `None` if the directory has no entry.
    fn lookup(&self, uid: u32) -> Option<ApplicationIdentity>;
}

/// Process-wide uid → identity cache
pub struct AppIdentityCache {
    directory: Arc<dyn AppDirectory>,
    no_system_override: HashSet<String>,
    cache: RwLock<HashMap<u32, Arc<ApplicationIdentity>>>,
    unknown: Arc<ApplicationIdentity>,
}

impl AppIdentityCache {
    pub fn new(directory: Arc<dyn AppDirectory>) -> Self {
        Self::with_overrides(directory, Vec::new())
    }

    /// `no_system_override` names packages that are never treated as system
    /// apps, whatever the directory says.
    pub fn with_overrides(directory: Arc<dyn AppDirectory>, no_system_override: Vec<String>) -> Self {
        Self {
            directory,
            no_system_override: no_system_override.into_iter().collect(),
            cache: RwLock::new(HashMap::new()),
            unknown: Arc::new(ApplicationIdentity::unknown()),
        }
    }

    pub fn unknown(&self) -> Arc<ApplicationIdentity> {
        self.unknown.clone()
    }

    pub fn identity_for_uid(&self, uid: u32) -> Arc<ApplicationIdentity> {
        if let Some(identity) = self.cache.read().get(&uid) {
            return identity.clone();
        }

        let identity = Arc::new(self.resolve(uid));
        debug!(
            "uid {} is {} (system: {})",
            uid, identity.package_name, identity.is_system
        );

        // Another thread may have raced us; keep whichever landed first
        self.cache
            .write()
            .entry(uid)
            .or_insert(identity)
            .clone()
    }

    fn resolve(&self, uid: u32) -> ApplicationIdentity {
        if uid == ROOT_UID {
            return ApplicationIdentity::root();
        }

        let mut identity = match self.directory.lookup(uid) {
            Some(identity) => identity,
            None if uid < FIRST_REGULAR_UID => ApplicationIdentity::system(),
            None => ApplicationIdentity::for_uid(uid),
        };

        if identity.is_system && self.no_system_override.contains(&identity.package_name) {
            identity.is_system = false;
        }
        identity
    }

    /// Drop a cached identity (package removed or reinstalled)
    pub fn invalidate(&self, uid: u32) {
        self.cache.write().remove(&uid);
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

/// [`AppDirectory`] over the local account database (`/etc/passwd`).
///
/// Each account is an "application": service accounts (uid < 1000) are
/// system apps, login accounts are not.
pub struct PasswdDirectory {
    path: PathBuf,
}

impl Default for PasswdDirectory {
    fn default() -> Self {
        Self::new("/etc/passwd")
    }
}

impl PasswdDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AppDirectory for PasswdDirectory {
    fn lookup(&self, uid: u32) -> Option<ApplicationIdentity> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!("Cannot read {:?}: {}", self.path, e);
                return None;
            }
        };
        content.lines().find_map(|line| parse_passwd_line(line, uid))
    }
}

/// `name:x:uid:gid:gecos:home:shell`
fn parse_passwd_line(line: &str, uid: u32) -> Option<ApplicationIdentity> {
    if line.starts_with('#') {
        return None;
    }
    let mut fields = line.split(':');
    let name = fields.next()?;
    let entry_uid: u32 = fields.nth(1)?.parse().ok()?;
    if entry_uid != uid {
        return None;
    }
    let gecos = fields.nth(1).unwrap_or("");
    let label = gecos.split(',').next().filter(|s| !s.is_empty()).unwrap_or(name);

    Some(ApplicationIdentity::new(name, label, uid < FIRST_REGULAR_UID))
}
