use std::time::SystemTime;

/// Metadata of a stored object.
///
/// The default value is the empty attribute set: size 0 and no timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub size: u64,
    pub last_modified: Option<SystemTime>,
}

/// Entry handed to an iteration callback.
///
/// Only the attributes requested through iter options are populated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IterObjectAttributes {
    pub name: String,
    last_modified: Option<SystemTime>,
}

impl IterObjectAttributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_modified: None,
        }
    }

    pub fn set_last_modified(&mut self, t: SystemTime) {
        self.last_modified = Some(t);
    }

    /// `None` unless `IterOption::WithUpdatedAt` was requested.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// True for synthetic directory markers produced by non-recursive listings.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with(crate::DIR_DELIM)
    }
}
