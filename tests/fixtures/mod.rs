//! Shared fixture values for pipeline tests

#![allow(dead_code)]

use device_guard::models::flag::GeoFix;

pub const USER: &str = "1042";
pub const OTHER_USER: &str = "2077";

/// A fix inside range with more than six decimals, to exercise rounding.
pub const FIX: GeoFix = GeoFix {
    latitude: 19.0760123,
    longitude: 72.8776559,
};

/// Bytes a fake camera writes in place of an encoded JPEG.
pub const STILL_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0fake-still\xFF\xD9";
