//! Generic key/value payload used for service object update notifications.
//!
//! Each key maps to exactly one value: a scalar, a character sequence, or a
//! nested parcelable (stored pre-serialized; both ends agree on its type).

use std::collections::HashMap;

use crate::error::Result;
use crate::parcel::{Parcel, Parcelable};

#[derive(Debug, Clone, PartialEq)]
pub enum BundleValue {
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    CharSequence(String),
    Parcelable(Vec<u8>),
}

mod tag {
    pub const BYTE: u8 = 1;
    pub const CHAR: u8 = 2;
    pub const SHORT: u8 = 3;
    pub const INT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const FLOAT: u8 = 6;
    pub const DOUBLE: u8 = 7;
    pub const CHAR_SEQUENCE: u8 = 8;
    pub const PARCELABLE: u8 = 9;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    values: HashMap<String, BundleValue>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn get(&self, key: &str) -> Option<&BundleValue> {
        self.values.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: BundleValue) {
        self.values.insert(key.into(), value);
    }

    pub fn put_byte(&mut self, key: impl Into<String>, value: i8) {
        self.put(key, BundleValue::Byte(value));
    }

    pub fn put_char(&mut self, key: impl Into<String>, value: u16) {
        self.put(key, BundleValue::Char(value));
    }

    pub fn put_short(&mut self, key: impl Into<String>, value: i16) {
        self.put(key, BundleValue::Short(value));
    }

    pub fn put_int(&mut self, key: impl Into<String>, value: i32) {
        self.put(key, BundleValue::Int(value));
    }

    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.put(key, BundleValue::Long(value));
    }

    pub fn put_float(&mut self, key: impl Into<String>, value: f32) {
        self.put(key, BundleValue::Float(value));
    }

    pub fn put_double(&mut self, key: impl Into<String>, value: f64) {
        self.put(key, BundleValue::Double(value));
    }

    pub fn put_char_sequence(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put(key, BundleValue::CharSequence(value.into()));
    }

    pub fn put_parcelable<P: Parcelable>(
        &mut self,
        key: impl Into<String>,
        value: &P,
    ) -> Result<()> {
        let mut blob = Parcel::new();
        value.write_to_parcel(&mut blob)?;
        self.put(key, BundleValue::Parcelable(blob.to_vec()));
        Ok(())
    }

    pub fn get_byte(&self, key: &str) -> Option<i8> {
        match self.values.get(key) {
            Some(BundleValue::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_char(&self, key: &str) -> Option<u16> {
        match self.values.get(key) {
            Some(BundleValue::Char(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_short(&self, key: &str) -> Option<i16> {
        match self.values.get(key) {
            Some(BundleValue::Short(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.values.get(key) {
            Some(BundleValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(BundleValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.values.get(key) {
            Some(BundleValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(BundleValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_char_sequence(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(BundleValue::CharSequence(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_parcelable<P: Parcelable>(&self, key: &str) -> Result<Option<P>> {
        match self.values.get(key) {
            Some(BundleValue::Parcelable(blob)) => {
                let mut parcel = Parcel::from_bytes(blob.clone());
                Ok(Some(P::read_from_parcel(&mut parcel)?))
            }
            _ => Ok(None),
        }
    }
}

impl Parcelable for Bundle {
    fn write_to_parcel(&self, dest: &mut Parcel) -> Result<()> {
        dest.write_i32(self.values.len() as i32);
        for (key, value) in &self.values {
            dest.write_str(key);
            match value {
                BundleValue::Byte(v) => {
                    dest.write_u8(tag::BYTE);
                    dest.write_u8(*v as u8);
                }
                BundleValue::Char(v) => {
                    dest.write_u8(tag::CHAR);
                    dest.write_u16(*v);
                }
                BundleValue::Short(v) => {
                    dest.write_u8(tag::SHORT);
                    dest.write_i16(*v);
                }
                BundleValue::Int(v) => {
                    dest.write_u8(tag::INT);
                    dest.write_i32(*v);
                }
                BundleValue::Long(v) => {
                    dest.write_u8(tag::LONG);
                    dest.write_i64(*v);
                }
                BundleValue::Float(v) => {
                    dest.write_u8(tag::FLOAT);
                    dest.write_f32(*v);
                }
                BundleValue::Double(v) => {
                    dest.write_u8(tag::DOUBLE);
                    dest.write_f64(*v);
                }
                BundleValue::CharSequence(v) => {
                    dest.write_u8(tag::CHAR_SEQUENCE);
                    dest.write_str(v);
                }
                BundleValue::Parcelable(blob) => {
                    dest.write_u8(tag::PARCELABLE);
                    dest.write_bytes(blob);
                }
            }
        }
        Ok(())
    }

    fn read_from_parcel(source: &mut Parcel) -> Result<Self> {
        let count = source.read_i32()?;
        let mut bundle = Bundle::new();
        for _ in 0..count {
            let key = source.read_str()?;
            let value = match source.read_u8()? {
                tag::BYTE => BundleValue::Byte(source.read_u8()? as i8),
                tag::CHAR => BundleValue::Char(source.read_u16()?),
                tag::SHORT => BundleValue::Short(source.read_i16()?),
                tag::INT => BundleValue::Int(source.read_i32()?),
                tag::LONG => BundleValue::Long(source.read_i64()?),
                tag::FLOAT => BundleValue::Float(source.read_f32()?),
                tag::DOUBLE => BundleValue::Double(source.read_f64()?),
                tag::CHAR_SEQUENCE => BundleValue::CharSequence(source.read_str()?),
                tag::PARCELABLE => BundleValue::Parcelable(source.read_bytes()?),
                tag => return Err(crate::error::Error::UnknownCode(tag as i32)),
            };
            bundle.put(key, value);
        }
        Ok(bundle)
    }
}
