//! Declarative helpers shared across the crate.

/// Declares numeric error code constants together with a lookup for their
/// human readable description.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:expr),* $(,)?) => {
        $(pub const $name: i32 = $code;)*

        /// Returns the description registered for an error code.
        pub fn get_error_message(code: i32) -> &'static str {
            match code {
                $($name => $msg,)*
                _ => "Unknown error",
            }
        }
    };
}

/// Declares a `u8`-tagged enum with lossless conversion from the raw tag.
macro_rules! define_field_type {
    ($(#[$meta:meta])* $vis:vis enum $ty:ident { $($name:ident = $val:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        $vis enum $ty {
            $($name = $val,)*
        }

        impl $ty {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($val => Some($ty::$name),)*
                    _ => None,
                }
            }
        }
    };
}
