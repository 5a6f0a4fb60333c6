//! Detection of floats that have no JSON representation
//!
//! `serde_json` writes NaN and ±Infinity as `null`, which would silently
//! replace the value for every reader of the remote tier. This serializer
//! walks a value and fails on the first non-finite float.

use serde::ser::{self, Serialize};

struct FiniteCheck;

type CheckResult = Result<(), serde_json::Error>;

/// Whether every float inside `value` survives a JSON round trip
pub(crate) fn has_finite_floats<T: Serialize + ?Sized>(value: &T) -> bool {
    value.serialize(&mut FiniteCheck).is_ok()
}

fn check(v: f64) -> CheckResult {
    if v.is_finite() {
        Ok(())
    } else {
        Err(ser::Error::custom("non-finite float"))
    }
}

impl ser::Serializer for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> CheckResult {
        Ok(())
    }
    fn serialize_i8(self, _v: i8) -> CheckResult {
        Ok(())
    }
    fn serialize_i16(self, _v: i16) -> CheckResult {
        Ok(())
    }
    fn serialize_i32(self, _v: i32) -> CheckResult {
        Ok(())
    }
    fn serialize_i64(self, _v: i64) -> CheckResult {
        Ok(())
    }
    fn serialize_i128(self, _v: i128) -> CheckResult {
        Ok(())
    }
    fn serialize_u8(self, _v: u8) -> CheckResult {
        Ok(())
    }
    fn serialize_u16(self, _v: u16) -> CheckResult {
        Ok(())
    }
    fn serialize_u32(self, _v: u32) -> CheckResult {
        Ok(())
    }
    fn serialize_u64(self, _v: u64) -> CheckResult {
        Ok(())
    }
    fn serialize_u128(self, _v: u128) -> CheckResult {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> CheckResult {
        check(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> CheckResult {
        check(v)
    }
    fn serialize_char(self, _v: char) -> CheckResult {
        Ok(())
    }
    fn serialize_str(self, _v: &str) -> CheckResult {
        Ok(())
    }
    fn serialize_bytes(self, _v: &[u8]) -> CheckResult {
        Ok(())
    }
    fn serialize_none(self) -> CheckResult {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> CheckResult {
        value.serialize(self)
    }
    fn serialize_unit(self) -> CheckResult {
        Ok(())
    }
    fn serialize_unit_struct(self, _name: &'static str) -> CheckResult {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> CheckResult {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(self)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple(self, _len: usize) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, serde_json::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeMap for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> CheckResult {
        key.serialize(&mut **self)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeStruct for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

impl ser::SerializeStructVariant for &mut FiniteCheck {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> CheckResult {
        value.serialize(&mut **self)
    }
    fn end(self) -> CheckResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Reading {
        sensor: String,
        samples: Vec<f64>,
        calibration: Option<f32>,
    }

    #[test]
    fn test_finite_values_pass() {
        let reading = Reading {
            sensor: "t1".to_owned(),
            samples: vec![1.5, -0.0, 1e300],
            calibration: Some(0.5),
        };
        assert!(has_finite_floats(&reading));
        assert!(has_finite_floats(&"caw"));
        assert!(has_finite_floats(&BTreeMap::from([("a", 1u8)])));
    }

    #[test]
    fn test_non_finite_floats_are_found_at_any_depth() {
        assert!(!has_finite_floats(&f64::NAN));
        assert!(!has_finite_floats(&f32::INFINITY));

        let reading = Reading {
            sensor: "t1".to_owned(),
            samples: vec![1.0, f64::NEG_INFINITY],
            calibration: None,
        };
        assert!(!has_finite_floats(&reading));
        assert!(!has_finite_floats(&BTreeMap::from([("a", f64::NAN)])));
    }
}
