//! Address, package and quote model
//!
//! Addresses are normalized on construction (trimmed fields, digits-only
//! postal code, upper-case state). Prices are integer cents.

use serde::{Deserialize, Serialize};

/// Divisor used to derive volumetric weight (cm³ per kg).
pub const VOLUMETRIC_DIVISOR: u64 = 6000;

/// Postal address of a sender or recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub street: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complement: Option<String>,
    pub district: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Address {
    /// Return a normalized copy of this address.
    pub fn normalized(&self) -> Self {
        let trim_opt = |v: &Option<String>| {
            v.as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            name: self.name.trim().to_string(),
            street: self.street.trim().to_string(),
            number: self.number.trim().to_string(),
            complement: trim_opt(&self.complement),
            district: self.district.trim().to_string(),
            city: self.city.trim().to_string(),
            state: self.state.trim().to_ascii_uppercase(),
            postal_code: self
                .postal_code
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect(),
            phone: trim_opt(&self.phone),
        }
    }

    /// Check required fields, returning the name of the first missing one.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("name");
        }
        if self.street.trim().is_empty() {
            return Err("street");
        }
        if self.city.trim().is_empty() {
            return Err("city");
        }
        if self.state.trim().len() != 2 {
            return Err("state");
        }
        let digits = self.postal_code.chars().filter(|c| c.is_ascii_digit()).count();
        if digits != 8 {
            return Err("postal_code");
        }
        Ok(())
    }
}

/// Physical package format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFormat {
    Box,
    Envelope,
    Roll,
}

impl Default for PackageFormat {
    fn default() -> Self {
        PackageFormat::Box
    }
}

/// Package attributes as declared at quote time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Declared weight in grams
    pub weight_grams: u64,
    pub length_cm: u32,
    pub width_cm: u32,
    pub height_cm: u32,
    #[serde(default)]
    pub format: PackageFormat,
}

impl Package {
    /// Volumetric weight in grams
    pub fn volumetric_weight_grams(&self) -> u64 {
        let volume_cm3 = self.length_cm as u64 * self.width_cm as u64 * self.height_cm as u64;
        volume_cm3 * 1000 / VOLUMETRIC_DIVISOR
    }

    /// Weight used for pricing: max of declared and volumetric weight
    pub fn billable_weight_grams(&self) -> u64 {
        self.weight_grams.max(self.volumetric_weight_grams())
    }
}

/// Pickup option chosen at checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupOption {
    /// Driver collects at the sender address
    Collect,
    /// Sender drops the package at a partner point
    DropOff,
}

impl PickupOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickupOption::Collect => "collect",
            PickupOption::DropOff => "drop_off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(PickupOption::Collect),
            "drop_off" => Some(PickupOption::DropOff),
            _ => None,
        }
    }
}

/// A computed quote for one service option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub service: String,
    pub price_cents: i64,
    pub delivery_days: u32,
}

/// Pricing table for one service: base price plus a per-kilogram rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRate {
    pub service: String,
    pub base_cents: i64,
    pub per_kg_cents: i64,
    pub delivery_days: u32,
}

impl ServiceRate {
    /// Price a package: billable weight rounded up to the next kilogram.
    pub fn quote(&self, package: &Package) -> Quote {
        let kg = package.billable_weight_grams().div_ceil(1000).max(1) as i64;
        Quote {
            service: self.service.clone(),
            price_cents: self.base_cents + self.per_kg_cents * kg,
            delivery_days: self.delivery_days,
        }
    }
}
