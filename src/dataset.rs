use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;

pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{name}")
    }
}

// Binds `$t` to the element type of `$dtype` inside `$body`.
macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::dataset::DType::I8 => {
                type $t = i8;
                $body
            }
            $crate::dataset::DType::U8 => {
                type $t = u8;
                $body
            }
            $crate::dataset::DType::I16 => {
                type $t = i16;
                $body
            }
            $crate::dataset::DType::I32 => {
                type $t = i32;
                $body
            }
            $crate::dataset::DType::I64 => {
                type $t = i64;
                $body
            }
            $crate::dataset::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::dataset::DType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

macro_rules! with_array {
    ($data:expr, $array:ident => $body:expr) => {
        match $data {
            $crate::dataset::ArrayData::I8($array) => $body,
            $crate::dataset::ArrayData::U8($array) => $body,
            $crate::dataset::ArrayData::I16($array) => $body,
            $crate::dataset::ArrayData::I32($array) => $body,
            $crate::dataset::ArrayData::I64($array) => $body,
            $crate::dataset::ArrayData::F32($array) => $body,
            $crate::dataset::ArrayData::F64($array) => $body,
        }
    };
}

pub(crate) use with_array;
pub(crate) use with_dtype;

pub trait Element: Copy + PartialEq + fmt::Debug + AsPrimitive<f64> + Send + Sync + 'static {
    const DTYPE: DType;
    fn wrap(array: ArrayD<Self>) -> ArrayData;
    fn unwrap(data: &ArrayData) -> Option<&ArrayD<Self>>;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn wrap(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$variant(array)
            }

            fn unwrap(data: &ArrayData) -> Option<&ArrayD<Self>> {
                match data {
                    ArrayData::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    I8(ArrayD<i8>),
    U8(ArrayD<u8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

element!(i8, I8);
element!(u8, U8);
element!(i16, I16);
element!(i32, I32);
element!(i64, I64);
element!(f32, F32);
element!(f64, F64);

impl ArrayData {
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        T::wrap(Array1::from(values).into_dyn())
    }

    /// Converts numbers into `dtype`; `None` entries become `fill`.
    pub fn from_f64s(dtype: DType, values: &[Option<f64>], fill: f64) -> Self {
        with_dtype!(dtype, T => {
            let values: Vec<T> = values.iter().map(|value| value.unwrap_or(fill).as_()).collect();
            Self::from_vec(values)
        })
    }

    pub fn filled(dtype: DType, shape: &[usize], fill: f64) -> Self {
        with_dtype!(dtype, T => {
            let fill: T = fill.as_();
            T::wrap(ArrayD::from_elem(IxDyn(shape), fill))
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::I8(_) => DType::I8,
            ArrayData::U8(_) => DType::U8,
            ArrayData::I16(_) => DType::I16,
            ArrayData::I32(_) => DType::I32,
            ArrayData::I64(_) => DType::I64,
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, array => array.shape())
    }

    pub fn len(&self) -> usize {
        with_array!(self, array => array.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reshape(self, shape: &[usize]) -> Result<Self, IngestError> {
        let reshape_error = |err: ndarray::ShapeError| {
            IngestError::InvalidConfig(format!("cannot lay out data as {shape:?}: {err}"))
        };
        Ok(with_array!(self, array => Element::wrap(
            ArrayD::from_shape_vec(IxDyn(shape), array.iter().copied().collect())
                .map_err(reshape_error)?
        )))
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        with_array!(self, array => array.iter().nth(index).map(|value| value.as_()))
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_array!(self, array => array.iter().map(|value| value.as_()).collect())
    }

    /// Flat C-order copy; `None` when `T` is not the stored type.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        T::unwrap(self).map(|array| array.iter().copied().collect())
    }

    pub fn concat(parts: &[&ArrayData], axis: usize) -> Result<Self, String> {
        let first = parts.first().ok_or("nothing to concatenate")?;
        with_dtype!(first.dtype(), T => concat_typed::<T>(parts, axis))
    }
}

fn concat_typed<T: Element>(parts: &[&ArrayData], axis: usize) -> Result<ArrayData, String> {
    let views = parts
        .iter()
        .map(|part| {
            T::unwrap(part)
                .map(ArrayD::view)
                .ok_or_else(|| format!("dtype {} differs from {}", part.dtype(), T::DTYPE))
        })
        .collect::<Result<Vec<ArrayViewD<'_, T>>, String>>()?;
    ndarray::concatenate(Axis(axis), &views)
        .map(T::wrap)
        .map_err(|err| err.to_string())
}

pub fn default_fill(dtype: DType) -> f64 {
    if dtype.is_float() { f64::NAN } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    dims: Vec<String>,
    data: ArrayData,
    pub attrs: Attributes,
    // Storage hints carried over from the source file, cleared before writing.
    pub encoding: Attributes,
    chunks: Option<Vec<usize>>,
}

impl Variable {
    pub fn new<S: Into<String>>(
        dims: impl IntoIterator<Item = S>,
        shape: Vec<usize>,
        data: ArrayData,
    ) -> Result<Self, IngestError> {
        let dims: Vec<String> = dims.into_iter().map(Into::into).collect();
        if dims.len() != shape.len() {
            return Err(IngestError::InvalidConfig(format!(
                "{} dimension names for a {}-d shape",
                dims.len(),
                shape.len()
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(IngestError::InvalidConfig(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        let data = if data.shape() == shape.as_slice() {
            data
        } else {
            data.reshape(&shape)?
        };
        Ok(Self {
            dims,
            data,
            attrs: Attributes::new(),
            encoding: Attributes::new(),
            chunks: None,
        })
    }

    pub fn from_values<T: Element>(dim: &str, values: Vec<T>) -> Self {
        Self {
            dims: vec![dim.to_string()],
            data: ArrayData::from_vec(values),
            attrs: Attributes::new(),
            encoding: Attributes::new(),
            chunks: None,
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn chunks(&self) -> Option<&[usize]> {
        self.chunks.as_deref()
    }

    pub fn set_chunks(&mut self, chunks: Vec<usize>) {
        self.chunks = Some(chunks);
    }

    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn len_along(&self, dim: &str) -> Option<usize> {
        self.axis_of(dim).map(|axis| self.shape()[axis])
    }

    pub fn fill_value(&self) -> f64 {
        self.attrs
            .get("_FillValue")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| default_fill(self.dtype()))
    }

    pub fn filled_like(&self, axis: usize, len: usize) -> Self {
        let mut shape = self.shape().to_vec();
        shape[axis] = len;
        Self {
            dims: self.dims.clone(),
            data: ArrayData::filled(self.dtype(), &shape, self.fill_value()),
            attrs: self.attrs.clone(),
            encoding: Attributes::new(),
            chunks: None,
        }
    }

    pub fn concat(name: &str, parts: &[&Variable], axis: usize) -> Result<Self, IngestError> {
        let geometry_error = |reason: String| IngestError::Geometry {
            variable: name.to_string(),
            reason,
        };
        let first = parts
            .first()
            .ok_or_else(|| geometry_error("nothing to concatenate".to_string()))?;
        for part in parts {
            if part.dims != first.dims {
                return Err(geometry_error(format!(
                    "dims {:?} differ from {:?}",
                    part.dims, first.dims
                )));
            }
            for (d, (a, b)) in part.shape().iter().zip(first.shape()).enumerate() {
                if d != axis && a != b {
                    return Err(geometry_error(format!(
                        "length {a} along `{}` differs from {b}",
                        first.dims[d]
                    )));
                }
            }
        }
        let data: Vec<&ArrayData> = parts.iter().map(|part| &part.data).collect();
        let data = ArrayData::concat(&data, axis).map_err(geometry_error)?;

        let mut attrs = Attributes::new();
        for part in parts {
            attrs.extend(part.attrs.clone());
        }
        Ok(Self {
            dims: first.dims.clone(),
            data,
            attrs,
            encoding: Attributes::new(),
            chunks: None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    dims: BTreeMap<String, usize>,
    variables: BTreeMap<String, Variable>,
    coords: BTreeSet<String>,
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coord(mut self, name: &str, variable: Variable) -> Result<Self, IngestError> {
        self.insert(name, variable, true)?;
        Ok(self)
    }

    pub fn with_data_var(mut self, name: &str, variable: Variable) -> Result<Self, IngestError> {
        self.insert(name, variable, false)?;
        Ok(self)
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(
        &mut self,
        name: &str,
        variable: Variable,
        is_coord: bool,
    ) -> Result<(), IngestError> {
        for (dim, len) in variable.dims.iter().zip(variable.shape()) {
            let other_users = self
                .variables
                .iter()
                .any(|(other, var)| other != name && var.dims.contains(dim));
            match self.dims.get(dim) {
                Some(existing) if existing != len && other_users => {
                    return Err(IngestError::Geometry {
                        variable: name.to_string(),
                        reason: format!("dimension `{dim}` has length {len}, expected {existing}"),
                    });
                }
                _ => {
                    self.dims.insert(dim.clone(), *len);
                }
            }
        }
        if is_coord {
            self.coords.insert(name.to_string());
        } else {
            self.coords.remove(name);
        }
        self.variables.insert(name.to_string(), variable);
        Ok(())
    }

    pub fn dims(&self) -> &BTreeMap<String, usize> {
        &self.dims
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.variables.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn is_coord(&self, name: &str) -> bool {
        self.coords.contains(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.variables.iter().map(|(name, var)| (name.as_str(), var))
    }

    pub fn variables_mut(&mut self) -> impl Iterator<Item = (&str, &mut Variable)> {
        self.variables
            .iter_mut()
            .map(|(name, var)| (name.as_str(), var))
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Keeps the variables `keep` accepts and drops dimensions left unused.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.variables.retain(|name, _| keep(name.as_str()));
        let variables = &self.variables;
        self.coords.retain(|name| variables.contains_key(name));
        self.dims
            .retain(|dim, _| variables.values().any(|var| var.dims.contains(dim)));
    }

    pub fn coord_values(&self, dim: &str) -> Option<Vec<f64>> {
        self.variables
            .get(dim)
            .filter(|var| var.dims.len() == 1 && var.dims[0] == dim)
            .map(|var| var.data.to_f64_vec())
    }
}
