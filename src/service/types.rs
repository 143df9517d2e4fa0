//! Types that may be placed in shared memory and their signatures

use std::mem::{align_of, size_of};

use crate::{
    error::{EaselError, Result},
    memory::CACHE_LINE_SIZE,
};

/// Maximum number of type name bytes kept in a signature
pub const MAX_TYPE_NAME_LEN: usize = 96;

/// Marker for types with a stable, process independent layout
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or a primitive), must not contain
/// pointers, references or handles of any kind and must be valid for any
/// bit pattern a peer process may write.
///
/// Independently compiled binaries only match if they report the same
/// [`ZeroCopySend::type_name`]; override it when the default, which contains
/// the module path, differs between the binaries sharing a service.
pub unsafe trait ZeroCopySend: Sized + 'static {
    /// Name that identifies the type across processes
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

macro_rules! zero_copy_send_primitives {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ZeroCopySend for $t {})*
    };
}

zero_copy_send_primitives!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64
);

unsafe impl<T: ZeroCopySend, const N: usize> ZeroCopySend for [T; N] {}

/// Whether the payload is a single value or a bounded slice of values
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeVariant {
    FixedSize = 1,
    Slice = 2,
}

/// Fixed-layout signature of a payload or user header type
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TypeSignature {
    variant: u32,
    name_hash: u32,
    size: u64,
    align: u64,
    name_len: u32,
    _reserved: u32,
    name: [u8; MAX_TYPE_NAME_LEN],
}

impl TypeSignature {
    fn build<T: ZeroCopySend>(variant: TypeVariant) -> Self {
        let full_name = T::type_name();
        let bytes = full_name.as_bytes();
        let len = bytes.len().min(MAX_TYPE_NAME_LEN);
        let mut name = [0u8; MAX_TYPE_NAME_LEN];
        name[..len].copy_from_slice(&bytes[..len]);

        Self {
            variant: variant as u32,
            name_hash: crc32fast::hash(bytes),
            size: size_of::<T>() as u64,
            align: align_of::<T>() as u64,
            name_len: len as u32,
            _reserved: 0,
            name,
        }
    }

    /// Signature of a single value of `T`
    pub fn of<T: ZeroCopySend>() -> Self {
        Self::build::<T>(TypeVariant::FixedSize)
    }

    /// Signature of a slice whose elements are `T`
    pub fn slice_of<T: ZeroCopySend>() -> Self {
        Self::build::<T>(TypeVariant::Slice)
    }

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Alignment of one element in bytes
    pub fn align(&self) -> usize {
        self.align as usize
    }

    /// Single value or slice
    pub fn variant(&self) -> Option<TypeVariant> {
        match self.variant {
            1 => Some(TypeVariant::FixedSize),
            2 => Some(TypeVariant::Slice),
            _ => None,
        }
    }

    /// Type name, possibly truncated
    pub fn type_name(&self) -> &str {
        let len = (self.name_len as usize).min(MAX_TYPE_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("<invalid utf-8>")
    }

    /// Reject layouts the pool cannot place
    pub fn validate(&self) -> Result<()> {
        if self.align() == 0 || !self.align().is_power_of_two() || self.align() > CACHE_LINE_SIZE {
            return Err(EaselError::invalid_parameter(
                "align",
                format!(
                    "Alignment {} of {} is not supported (max {})",
                    self.align(),
                    self.type_name(),
                    CACHE_LINE_SIZE
                ),
            ));
        }
        Ok(())
    }

    /// Human readable difference to another signature, if any
    pub fn difference(&self, other: &Self) -> Option<String> {
        if self == other {
            return None;
        }
        Some(format!(
            "{} (size {}, align {}, {:?}) vs {} (size {}, align {}, {:?})",
            self.type_name(),
            self.size,
            self.align,
            self.variant(),
            other.type_name(),
            other.size,
            other.align,
            other.variant()
        ))
    }
}

impl std::fmt::Debug for TypeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSignature")
            .field("name", &self.type_name())
            .field("variant", &self.variant())
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    struct CustomHeader {
        version: i32,
        timestamp: u64,
    }

    unsafe impl ZeroCopySend for CustomHeader {
        fn type_name() -> &'static str {
            "CustomHeader"
        }
    }

    #[test]
    fn test_signature_of_primitive() {
        let sig = TypeSignature::of::<u64>();
        assert_eq!(sig.size(), 8);
        assert_eq!(sig.align(), 8);
        assert_eq!(sig.variant(), Some(TypeVariant::FixedSize));
        assert_eq!(sig.type_name(), "u64");
        assert!(sig.validate().is_ok());
    }

    #[test]
    fn test_custom_type_name() {
        let sig = TypeSignature::of::<CustomHeader>();
        assert_eq!(sig.type_name(), "CustomHeader");
        assert_eq!(sig.size(), 16);
    }

    #[test]
    fn test_signatures_differ() {
        assert!(TypeSignature::of::<u64>().difference(&TypeSignature::of::<u64>()).is_none());
        assert!(TypeSignature::of::<u64>().difference(&TypeSignature::of::<i64>()).is_some());
        assert!(TypeSignature::of::<u8>()
            .difference(&TypeSignature::slice_of::<u8>())
            .is_some());
        assert!(TypeSignature::of::<[u8; 4]>()
            .difference(&TypeSignature::of::<u32>())
            .is_some());
    }

    #[test]
    fn test_over_aligned_type_rejected() {
        #[repr(C, align(128))]
        struct Wide([u8; 128]);
        unsafe impl ZeroCopySend for Wide {}

        assert!(TypeSignature::of::<Wide>().validate().is_err());
    }
}
