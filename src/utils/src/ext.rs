use log::{error, warn};
use std::fmt::Debug;

/// Shortcuts for results whose failure is worth a log line but nothing
/// more, typically best-effort cleanup and probes.
pub trait ResultExt<T> {
    fn ok_or_warn(self) -> Option<T>;

    /// Drops the result, logging a failure with the given context.
    fn log_if_error(self, context: &str);
}

impl<T, E: Debug> ResultExt<T> for Result<T, E> {
    fn ok_or_warn(self) -> Option<T> {
        self.inspect_err(|err| warn!("{err:?}")).ok()
    }

    fn log_if_error(self, context: &str) {
        if let Err(err) = self {
            error!("{context}: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_or_warn_maps_to_option() {
        let ok: Result<i32, &str> = Ok(7);
        assert_eq!(ok.ok_or_warn(), Some(7));

        let failed: Result<i32, &str> = Err("nope");
        assert_eq!(failed.ok_or_warn(), None);
    }
}
