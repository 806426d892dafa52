//! Mapping of native Rust types to wire types.
//!
//! [`WireType`] names the type, [`Marshal`] and [`Unmarshal`] encode and
//! decode one complete value. Tuples map to structs; as message bodies they
//! are sequences of arguments instead, see [`Arguments`] and
//! [`FromArguments`].

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use chainerror::*;
use dbuslink_signature::{BasicType, Signature, Type};

use crate::error::*;
use crate::names::ObjectPath;
use crate::reader::Reader;
use crate::value::UnixFd;
use crate::variant::Variant;
use crate::writer::Writer;

pub trait WireType {
    fn wire_type() -> Type;

    fn signature() -> Result<Signature> {
        Signature::try_from(Self::wire_type()).map_context(ErrorKind::from_parse)
    }
}

/// Types usable as dict keys.
pub trait BasicWireType: WireType {
    fn basic_type() -> BasicType;
}

pub trait Marshal: WireType {
    fn marshal(&self, w: &mut Writer) -> Result<()>;
}

pub trait Unmarshal: WireType + Sized {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self>;
}

/// A message body: zero or more complete values.
pub trait Arguments {
    fn signature() -> Result<Signature>;
    fn marshal_args(&self, w: &mut Writer) -> Result<()>;
}

pub trait FromArguments: Sized {
    fn signature() -> Result<Signature>;
    fn unmarshal_args(r: &mut Reader<'_>) -> Result<Self>;
}

macro_rules! basic_impl {
    ($t:ty, $basic:ident, $append:ident, $get:ident) => {
        impl WireType for $t {
            fn wire_type() -> Type {
                Type::Basic(BasicType::$basic)
            }
        }

        impl BasicWireType for $t {
            fn basic_type() -> BasicType {
                BasicType::$basic
            }
        }

        impl Marshal for $t {
            fn marshal(&self, w: &mut Writer) -> Result<()> {
                w.$append(*self)
            }
        }

        impl Unmarshal for $t {
            fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
                r.$get()
            }
        }
    };
}

basic_impl!(u8, Byte, append_byte, get_byte);
basic_impl!(bool, Boolean, append_bool, get_bool);
basic_impl!(i16, Int16, append_i16, get_i16);
basic_impl!(u16, UInt16, append_u16, get_u16);
basic_impl!(i32, Int32, append_i32, get_i32);
basic_impl!(u32, UInt32, append_u32, get_u32);
basic_impl!(i64, Int64, append_i64, get_i64);
basic_impl!(u64, UInt64, append_u64, get_u64);
basic_impl!(f64, Double, append_f64, get_f64);
basic_impl!(UnixFd, UnixFd, append_unix_fd, get_unix_fd);

impl WireType for str {
    fn wire_type() -> Type {
        Type::Basic(BasicType::String)
    }
}

impl BasicWireType for str {
    fn basic_type() -> BasicType {
        BasicType::String
    }
}

impl Marshal for str {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.append_str(self)
    }
}

impl WireType for String {
    fn wire_type() -> Type {
        Type::Basic(BasicType::String)
    }
}

impl BasicWireType for String {
    fn basic_type() -> BasicType {
        BasicType::String
    }
}

impl Marshal for String {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.append_str(self)
    }
}

impl Unmarshal for String {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        r.get_string()
    }
}

impl WireType for ObjectPath {
    fn wire_type() -> Type {
        Type::Basic(BasicType::ObjectPath)
    }
}

impl BasicWireType for ObjectPath {
    fn basic_type() -> BasicType {
        BasicType::ObjectPath
    }
}

impl Marshal for ObjectPath {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.append_object_path(self)
    }
}

impl Unmarshal for ObjectPath {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        r.get_object_path()
    }
}

impl WireType for Signature {
    fn wire_type() -> Type {
        Type::Basic(BasicType::Signature)
    }
}

impl BasicWireType for Signature {
    fn basic_type() -> BasicType {
        BasicType::Signature
    }
}

impl Marshal for Signature {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.append_signature(self)
    }
}

impl Unmarshal for Signature {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        r.get_signature()
    }
}

impl WireType for Variant {
    fn wire_type() -> Type {
        Type::Variant
    }
}

impl Marshal for Variant {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.append_variant(self)
    }
}

impl Unmarshal for Variant {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        r.get_variant()
    }
}

impl<T: WireType + ?Sized> WireType for &T {
    fn wire_type() -> Type {
        T::wire_type()
    }
}

impl<T: BasicWireType + ?Sized> BasicWireType for &T {
    fn basic_type() -> BasicType {
        T::basic_type()
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        (**self).marshal(w)
    }
}

impl<T: WireType> WireType for [T] {
    fn wire_type() -> Type {
        Type::Array(Box::new(T::wire_type()))
    }
}

impl<T: Marshal> Marshal for [T] {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        w.open_array()?;
        for item in self {
            item.marshal(w)?;
        }
        w.close_array()
    }
}

impl<T: WireType> WireType for Vec<T> {
    fn wire_type() -> Type {
        Type::Array(Box::new(T::wire_type()))
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        self.as_slice().marshal(w)
    }
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        let mut v = Vec::new();
        r.open_array()?;
        while r.has_more() {
            v.push(T::unmarshal(r)?);
        }
        r.close_array()?;
        Ok(v)
    }
}

fn dict_type<K: BasicWireType, V: WireType>() -> Type {
    Type::Array(Box::new(Type::DictEntry(
        K::basic_type(),
        Box::new(V::wire_type()),
    )))
}

fn marshal_entries<'e, K, V, I>(w: &mut Writer, entries: I) -> Result<()>
where
    K: Marshal + 'e,
    V: Marshal + 'e,
    I: Iterator<Item = (&'e K, &'e V)>,
{
    w.open_array()?;
    for (k, v) in entries {
        w.open_dict_entry()?;
        k.marshal(w)?;
        v.marshal(w)?;
        w.close_dict_entry()?;
    }
    w.close_array()
}

fn unmarshal_entries<K: Unmarshal, V: Unmarshal, F: FnMut(K, V)>(
    r: &mut Reader<'_>,
    mut insert: F,
) -> Result<()> {
    r.open_array()?;
    while r.has_more() {
        r.open_dict_entry()?;
        let k = K::unmarshal(r)?;
        let v = V::unmarshal(r)?;
        r.close_dict_entry()?;
        insert(k, v);
    }
    r.close_array()
}

impl<K: BasicWireType, V: WireType, S> WireType for HashMap<K, V, S> {
    fn wire_type() -> Type {
        dict_type::<K, V>()
    }
}

impl<K: BasicWireType + Marshal, V: Marshal, S> Marshal for HashMap<K, V, S> {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        marshal_entries(w, self.iter())
    }
}

impl<K, V, S> Unmarshal for HashMap<K, V, S>
where
    K: BasicWireType + Unmarshal + Eq + Hash,
    V: Unmarshal,
    S: BuildHasher + Default,
{
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        let mut map = HashMap::default();
        unmarshal_entries(r, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl<K: BasicWireType, V: WireType> WireType for BTreeMap<K, V> {
    fn wire_type() -> Type {
        dict_type::<K, V>()
    }
}

impl<K: BasicWireType + Marshal, V: Marshal> Marshal for BTreeMap<K, V> {
    fn marshal(&self, w: &mut Writer) -> Result<()> {
        marshal_entries(w, self.iter())
    }
}

impl<K: BasicWireType + Unmarshal + Ord, V: Unmarshal> Unmarshal for BTreeMap<K, V> {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        let mut map = BTreeMap::new();
        unmarshal_entries(r, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl Arguments for () {
    fn signature() -> Result<Signature> {
        Ok(Signature::empty())
    }

    fn marshal_args(&self, _w: &mut Writer) -> Result<()> {
        Ok(())
    }
}

impl FromArguments for () {
    fn signature() -> Result<Signature> {
        Ok(Signature::empty())
    }

    fn unmarshal_args(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! tuple_impls {
    ($($name:ident $var:ident),+) => {
        impl<$($name: WireType),+> WireType for ($($name,)+) {
            fn wire_type() -> Type {
                Type::Struct(vec![$($name::wire_type()),+])
            }
        }

        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            fn marshal(&self, w: &mut Writer) -> Result<()> {
                let ($($var,)+) = self;
                w.open_struct()?;
                $($var.marshal(w)?;)+
                w.close_struct()
            }
        }

        impl<$($name: Unmarshal),+> Unmarshal for ($($name,)+) {
            fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
                r.open_struct()?;
                let value = ($($name::unmarshal(r)?,)+);
                r.close_struct()?;
                Ok(value)
            }
        }

        impl<$($name: Marshal),+> Arguments for ($($name,)+) {
            fn signature() -> Result<Signature> {
                Signature::from_types(vec![$($name::wire_type()),+])
                    .map_context(ErrorKind::from_parse)
            }

            fn marshal_args(&self, w: &mut Writer) -> Result<()> {
                let ($($var,)+) = self;
                $($var.marshal(w)?;)+
                Ok(())
            }
        }

        impl<$($name: Unmarshal),+> FromArguments for ($($name,)+) {
            fn signature() -> Result<Signature> {
                Signature::from_types(vec![$($name::wire_type()),+])
                    .map_context(ErrorKind::from_parse)
            }

            fn unmarshal_args(r: &mut Reader<'_>) -> Result<Self> {
                Ok(($($name::unmarshal(r)?,)+))
            }
        }
    };
}

tuple_impls!(A a);
tuple_impls!(A a, B b);
tuple_impls!(A a, B b, C c);
tuple_impls!(A a, B b, C c, D d);
tuple_impls!(A a, B b, C c, D d, E e);
tuple_impls!(A a, B b, C c, D d, E e, F f);
tuple_impls!(A a, B b, C c, D d, E e, F f, G g);
tuple_impls!(A a, B b, C c, D d, E e, F f, G g, H h);

/// Encode `args` as a body with its own signature.
pub fn encode_args<A: Arguments + ?Sized>(args: &A) -> Result<(Signature, Vec<u8>)> {
    let signature = A::signature()?;
    let mut w = Writer::new(&signature);
    args.marshal_args(&mut w)?;
    let body = w.finish()?;
    Ok((signature, body))
}
