/// Privilege checks for raw device access
///
/// Partitioning and writing a whole block device needs root; the CLI asks
/// here once before it enumerates anything.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    Root,
    User { euid: u32 },
}

impl Elevation {
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            let euid = unsafe { libc::geteuid() };
            if euid == 0 {
                Elevation::Root
            } else {
                Elevation::User { euid }
            }
        }

        #[cfg(not(unix))]
        {
            Elevation::User { euid: u32::MAX }
        }
    }

    pub fn is_elevated(self) -> bool {
        self == Elevation::Root
    }
}

/// Check if the current process may open block devices for writing
pub fn is_elevated() -> bool {
    Elevation::current().is_elevated()
}

/// Display elevation status information
pub fn get_elevation_status() -> String {
    match Elevation::current() {
        Elevation::Root => "Running as root".to_string(),
        Elevation::User { euid } => format!(
            "Running as uid {}. Writing to devices requires root, try sudo.",
            euid
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_status() {
        let status = get_elevation_status();
        assert!(!status.is_empty());
        assert_eq!(is_elevated(), status == "Running as root");
    }
}
