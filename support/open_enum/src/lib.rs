// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro for wire-format code points.

/// Declares a `#[repr(transparent)]` newtype over an integer whose named
/// values are associated constants.
///
/// Unlike a Rust `enum`, any value of the storage type is representable, so
/// the type can sit directly in wire structures and hold code points the
/// declaration does not know about. Several constants may share a value; the
/// first one declared is the canonical name.
///
/// The generated type derives `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`,
/// `Ord` and `PartialOrd`, and gets a `name` method plus a `Debug` impl that
/// prints the canonical name or, for unknown values, the raw number.
///
/// # Examples
///
/// ```
/// use open_enum::open_enum;
///
/// open_enum! {
///     pub enum Status: u8 {
///         GOOD = 0x00,
///         BUSY = 0x08,
///         QUEUE_FULL = 0x28,
///     }
/// }
///
/// assert_eq!(Status::BUSY.0, 0x08);
/// assert_eq!(Status(0x28).name(), Some("QUEUE_FULL"));
/// assert_eq!(Status(0x7f).name(), None);
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl $name {
            /// The canonical name of this value, if it has one.
            pub fn name(self) -> ::core::option::Option<&'static str> {
                #![allow(unreachable_patterns)]
                match self {
                    $( Self::$variant => ::core::option::Option::Some(stringify!($variant)), )*
                    _ => ::core::option::Option::None,
                }
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    ::core::option::Option::Some(s) => fmt.pad(s),
                    ::core::option::Option::None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }
    };
}
