/// Panics in debug builds; logs via `tracing::error!` and continues in
/// release builds.
///
/// Used at invariant checks on the I/O hot path, where panicking a worker
/// in production would take every socket on its reactor down with it.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    }};
}

/// Checks an invariant with [`safe_panic!`] semantics: a violated condition
/// panics in debug builds and logs in release builds.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!("invariant violated: {}", stringify!($cond));
        }
    };

    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::safe_panic!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invariant violated")]
    fn failed_assert_panics_in_debug() {
        safe_assert!(1 + 1 == 3);
    }

    #[test]
    fn passing_assert_is_silent() {
        safe_assert!(true);
        safe_assert!(2 > 1, "ordering broke");
    }
}
