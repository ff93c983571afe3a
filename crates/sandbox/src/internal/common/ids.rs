/// Defines a copyable integer id newtype (request ids, helper job ids, ...).
///
/// The id prints and parses as the bare number.
#[macro_export]
macro_rules! define_id_type {
    ($name: ident, $repr: ty) => {
        #[derive(
            ::std::marker::Copy,
            ::std::clone::Clone,
            ::std::default::Default,
            ::std::fmt::Debug,
            ::std::hash::Hash,
            ::std::cmp::Eq,
            ::std::cmp::PartialEq,
            ::std::cmp::Ord,
            ::std::cmp::PartialOrd,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            #[inline]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn as_num(self) -> $repr {
                self.0
            }
        }

        impl ::std::convert::From<$repr> for $name {
            #[inline]
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = ::std::num::ParseIntError;

            fn from_str(text: &str) -> ::std::result::Result<Self, Self::Err> {
                text.parse::<$repr>().map(Self)
            }
        }
    };
}
