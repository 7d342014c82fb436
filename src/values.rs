use std::fmt::{Debug, Display};

use half::{bf16, f16};

use crate::Error;

/// Type of the individual elements stored in [`Literal`]s and in device-side tensor data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    /// [`DType`] that represents the `true` and `false` predicate values.
    Pred,

    /// [`DType`] that represents signed 8-bit integer values.
    I8,

    /// [`DType`] that represents signed 16-bit integer values.
    I16,

    /// [`DType`] that represents signed 32-bit integer values.
    I32,

    /// [`DType`] that represents signed 64-bit integer values.
    I64,

    /// [`DType`] that represents unsigned 8-bit integer values.
    U8,

    /// [`DType`] that represents unsigned 16-bit integer values.
    U16,

    /// [`DType`] that represents unsigned 32-bit integer values.
    U32,

    /// [`DType`] that represents unsigned 64-bit integer values.
    U64,

    /// [`DType`] that represents 16-bit floating-point values with 8 exponent bits, 7 mantissa bits, and 1 sign bit.
    /// This type offers a larger dynamic range than [`DType::F16`] at the cost of lower precision.
    BF16,

    /// [`DType`] that represents 16-bit floating-point values with 5 exponent bits, 10 mantissa bits, and 1 sign bit,
    /// using the standard IEEE floating-point representation.
    F16,

    /// [`DType`] that represents 32-bit floating-point values using the standard IEEE floating-point representation.
    F32,

    /// [`DType`] that represents 64-bit floating-point values using the standard IEEE floating-point representation.
    F64,
}

impl DType {
    /// Returns the number of bytes that a single element of this [`DType`] occupies in a densely
    /// packed host buffer.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Pred | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::BF16 | Self::F16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Parses a rendered [`DType`] (e.g., an XLA primitive type string) into a [`DType`].
    #[allow(clippy::should_implement_trait)]
    pub fn from_str<S: AsRef<str>>(value: S) -> Result<Self, Error> {
        let value = value.as_ref();
        match value.trim().to_ascii_lowercase().as_str() {
            "pred" => Ok(Self::Pred),
            "s8" | "i8" => Ok(Self::I8),
            "s16" | "i16" => Ok(Self::I16),
            "s32" | "i32" => Ok(Self::I32),
            "s64" | "i64" => Ok(Self::I64),
            "u8" => Ok(Self::U8),
            "u16" => Ok(Self::U16),
            "u32" => Ok(Self::U32),
            "u64" => Ok(Self::U64),
            "bf16" => Ok(Self::BF16),
            "f16" => Ok(Self::F16),
            "f32" => Ok(Self::F32),
            "f64" => Ok(Self::F64),
            _ => Err(Error::invalid_argument(format!("invalid element type '{value}'"))),
        }
    }
}

impl Display for DType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Self::Pred => "pred",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::BF16 => "bf16",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        })
    }
}

/// Rust-native element type that corresponds to a [`DType`] and that can be stored in and loaded from [`Literal`]s.
/// The byte representation is little-endian so that [`Literal`] contents are deterministic across hosts.
pub trait NativeType: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// [`DType`] that corresponds to this [`NativeType`].
    const DTYPE: DType;

    /// Appends the little-endian byte representation of this value to the provided buffer.
    fn write_bytes(&self, buffer: &mut Vec<u8>);

    /// Reads a value from the provided little-endian bytes. The slice length must equal `Self::DTYPE.byte_size()`.
    fn read_bytes(bytes: &[u8]) -> Self;

    /// Returns the sum of this value and the provided value, used when evaluating element-wise additions.
    fn add(self, other: Self) -> Self;

    /// Returns the product of this value and the provided value, used when evaluating element-wise multiplications.
    fn mul(self, other: Self) -> Self;

    /// Converts the provided [`f64`] to this [`NativeType`], used when materializing scalar constants.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_native_type_for_int {
    ($ty:ty, $dtype:path) => {
        impl NativeType for $ty {
            const DTYPE: DType = $dtype;

            fn write_bytes(&self, buffer: &mut Vec<u8>) {
                buffer.extend_from_slice(&self.to_le_bytes());
            }

            fn read_bytes(bytes: &[u8]) -> Self {
                let mut value = [0u8; size_of::<$ty>()];
                value.copy_from_slice(bytes);
                <$ty>::from_le_bytes(value)
            }

            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

macro_rules! impl_native_type_for_float {
    ($ty:ty, $dtype:path) => {
        impl NativeType for $ty {
            const DTYPE: DType = $dtype;

            fn write_bytes(&self, buffer: &mut Vec<u8>) {
                buffer.extend_from_slice(&self.to_le_bytes());
            }

            fn read_bytes(bytes: &[u8]) -> Self {
                let mut value = [0u8; size_of::<$ty>()];
                value.copy_from_slice(bytes);
                <$ty>::from_le_bytes(value)
            }

            fn add(self, other: Self) -> Self {
                self + other
            }

            fn mul(self, other: Self) -> Self {
                self * other
            }

            fn from_f64(value: f64) -> Self {
                <$ty>::from_f64(value)
            }
        }
    };
}

impl_native_type_for_int!(i8, DType::I8);
impl_native_type_for_int!(i16, DType::I16);
impl_native_type_for_int!(i32, DType::I32);
impl_native_type_for_int!(i64, DType::I64);
impl_native_type_for_int!(u8, DType::U8);
impl_native_type_for_int!(u16, DType::U16);
impl_native_type_for_int!(u32, DType::U32);
impl_native_type_for_int!(u64, DType::U64);
impl_native_type_for_float!(bf16, DType::BF16);
impl_native_type_for_float!(f16, DType::F16);

impl NativeType for f32 {
    const DTYPE: DType = DType::F32;

    fn write_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        let mut value = [0u8; 4];
        value.copy_from_slice(bytes);
        f32::from_le_bytes(value)
    }

    fn add(self, other: Self) -> Self {
        self + other
    }

    fn mul(self, other: Self) -> Self {
        self * other
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl NativeType for f64 {
    const DTYPE: DType = DType::F64;

    fn write_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        let mut value = [0u8; 8];
        value.copy_from_slice(bytes);
        f64::from_le_bytes(value)
    }

    fn add(self, other: Self) -> Self {
        self + other
    }

    fn mul(self, other: Self) -> Self {
        self * other
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl NativeType for bool {
    const DTYPE: DType = DType::Pred;

    fn write_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self as u8);
    }

    fn read_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn add(self, other: Self) -> Self {
        self || other
    }

    fn mul(self, other: Self) -> Self {
        self && other
    }

    fn from_f64(value: f64) -> Self {
        value != 0.0
    }
}

/// Logical shape of a tensor, consisting of an element [`DType`] and a sequence of dimension sizes ordered from the
/// most major dimension to the most minor dimension. Host buffers described by a [`Shape`] are always densely packed
/// in row-major order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dtype: DType,
    dimensions: Vec<usize>,
}

impl Shape {
    /// Creates a new [`Shape`] with the provided element [`DType`] and dimension sizes.
    pub fn new(dtype: DType, dimensions: Vec<usize>) -> Self {
        Self { dtype, dimensions }
    }

    /// Creates a new scalar (i.e., rank-0) [`Shape`] with the provided element [`DType`].
    pub fn scalar(dtype: DType) -> Self {
        Self { dtype, dimensions: Vec::new() }
    }

    /// Returns the element [`DType`] of this [`Shape`].
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the dimension sizes of this [`Shape`], ordered from the most major to the most minor dimension.
    pub fn dimensions(&self) -> &[usize] {
        self.dimensions.as_slice()
    }

    /// Returns the rank (i.e., number of dimensions) of this [`Shape`].
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Returns the total number of elements described by this [`Shape`]. Scalar shapes contain a single element.
    pub fn element_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    /// Returns the total number of bytes that a densely packed host buffer with this [`Shape`] occupies.
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.byte_size()
    }

    /// Returns the dense, row-major byte strides of this [`Shape`] (i.e., for each dimension, the number of bytes
    /// between consecutive elements along that dimension).
    pub fn byte_strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.dimensions.len()];
        let mut stride = self.dtype.byte_size();
        for (index, size) in self.dimensions.iter().enumerate().rev() {
            strides[index] = stride;
            stride *= size;
        }
        strides
    }
}

impl Display for Shape {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}[", self.dtype)?;
        let mut dimensions = self.dimensions.iter();
        if let Some(first_dimension) = dimensions.next() {
            write!(formatter, "{first_dimension}")?;
            dimensions.try_for_each(|dimension| write!(formatter, ", {dimension}"))?;
        }
        formatter.write_str("]")
    }
}

impl Debug for Shape {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "Shape[{self}]")
    }
}

/// Host-side tensor value, consisting of a [`Shape`] and a densely packed, row-major, little-endian byte buffer.
/// [`Literal`]s are what transfers copy to and from devices.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    shape: Shape,
    bytes: Vec<u8>,
}

impl Literal {
    /// Creates a new [`Literal`] from the provided [`Shape`] and raw bytes. Returns [`Error::InvalidArgument`] if the
    /// buffer length does not match the byte size of the shape.
    pub fn from_bytes(shape: Shape, bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() != shape.byte_size() {
            return Err(Error::invalid_argument(format!(
                "literal buffer holds {} bytes but shape {shape} requires {} bytes",
                bytes.len(),
                shape.byte_size(),
            )));
        }
        Ok(Self { shape, bytes })
    }

    /// Creates a new [`Literal`] with the provided dimension sizes from a slice of [`NativeType`] elements laid out
    /// in row-major order. Returns [`Error::InvalidArgument`] if the element count does not match the dimensions.
    pub fn from_elements<T: NativeType>(dimensions: Vec<usize>, elements: &[T]) -> Result<Self, Error> {
        let shape = Shape::new(T::DTYPE, dimensions);
        if elements.len() != shape.element_count() {
            return Err(Error::invalid_argument(format!(
                "literal holds {} elements but shape {shape} requires {} elements",
                elements.len(),
                shape.element_count(),
            )));
        }
        let mut bytes = Vec::with_capacity(shape.byte_size());
        for element in elements {
            element.write_bytes(&mut bytes);
        }
        Ok(Self { shape, bytes })
    }

    /// Creates a new scalar (i.e., rank-0) [`Literal`] holding the provided value.
    pub fn scalar<T: NativeType>(value: T) -> Self {
        let mut bytes = Vec::with_capacity(T::DTYPE.byte_size());
        value.write_bytes(&mut bytes);
        Self { shape: Shape::scalar(T::DTYPE), bytes }
    }

    /// Returns the [`Shape`] of this [`Literal`].
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the raw bytes of this [`Literal`], densely packed in row-major order.
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Decodes the elements of this [`Literal`] as the provided [`NativeType`], in row-major order.
    /// Returns [`Error::InvalidArgument`] if the requested type does not match the literal [`DType`].
    pub fn to_elements<T: NativeType>(&self) -> Result<Vec<T>, Error> {
        if T::DTYPE != self.shape.dtype() {
            return Err(Error::invalid_argument(format!(
                "literal has element type '{}' but elements of type '{}' were requested",
                self.shape.dtype(),
                T::DTYPE,
            )));
        }
        Ok(self.bytes.chunks_exact(T::DTYPE.byte_size()).map(T::read_bytes).collect())
    }
}

impl Debug for Literal {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "Literal[{}]", self.shape)
    }
}

/// Host-side tensor paired with the device it should be copied to. [`TensorSource`]s are the inputs of
/// host-to-device transfers.
#[derive(Clone, Debug)]
pub struct TensorSource {
    /// Device string (e.g., `"CPU:0"`) naming the device that the literal should be copied to.
    pub device: String,

    /// Host-side tensor value that should be copied to the device.
    pub literal: Literal,
}

impl TensorSource {
    /// Creates a new [`TensorSource`] for copying the provided [`Literal`] to the named device.
    pub fn new<S: Into<String>>(device: S, literal: Literal) -> Self {
        Self { device: device.into(), literal }
    }
}
