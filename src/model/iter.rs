use std::fmt;

use crate::model::error::{Error, Result};

/// Iteration flags a caller may request.
///
/// Backends advertise the flags they honour through
/// `Bucket::supported_iter_options`; anything else is rejected with
/// `Error::OptionNotSupported` instead of being ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterOption {
    /// List every key below the prefix instead of one level with directory markers.
    Recursive,
    /// Populate `last_modified` on each entry.
    WithUpdatedAt,
}

impl IterOption {
    pub fn apply(&self, params: &mut IterParams) {
        match self {
            IterOption::Recursive => params.recursive = true,
            IterOption::WithUpdatedAt => params.last_modified = true,
        }
    }
}

impl fmt::Display for IterOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterOption::Recursive => write!(f, "Recursive"),
            IterOption::WithUpdatedAt => write!(f, "UpdatedAt"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterParams {
    pub recursive: bool,
    pub last_modified: bool,
}

pub fn apply_iter_options(options: &[IterOption]) -> IterParams {
    let mut params = IterParams::default();
    for opt in options {
        opt.apply(&mut params);
    }

    params
}

pub fn validate_iter_options(supported: &[IterOption], options: &[IterOption]) -> Result<()> {
    match options.iter().find(|opt| !supported.contains(opt)) {
        Some(opt) => Err(Error::OptionNotSupported(*opt)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_iter_options() {
        let cases = vec![
            (vec![], IterParams::default()),
            (
                vec![IterOption::Recursive],
                IterParams {
                    recursive: true,
                    last_modified: false,
                },
            ),
            (
                vec![IterOption::WithUpdatedAt, IterOption::Recursive],
                IterParams {
                    recursive: true,
                    last_modified: true,
                },
            ),
            (
                vec![IterOption::WithUpdatedAt, IterOption::WithUpdatedAt],
                IterParams {
                    recursive: false,
                    last_modified: true,
                },
            ),
        ];

        for (options, expected) in cases {
            assert_eq!(
                apply_iter_options(&options),
                expected,
                "failed for case: {:?}",
                options
            );
        }
    }

    #[test]
    fn test_validate_iter_options() {
        let recursive_only = [IterOption::Recursive];

        assert!(validate_iter_options(&recursive_only, &[]).is_ok());
        assert!(validate_iter_options(&recursive_only, &[IterOption::Recursive]).is_ok());
        assert!(matches!(
            validate_iter_options(
                &recursive_only,
                &[IterOption::Recursive, IterOption::WithUpdatedAt]
            ),
            Err(Error::OptionNotSupported(IterOption::WithUpdatedAt))
        ));
        assert!(matches!(
            validate_iter_options(&[], &[IterOption::Recursive]),
            Err(Error::OptionNotSupported(IterOption::Recursive))
        ));
    }
}
