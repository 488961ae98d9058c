//! The closed set of sampled quantities.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// A value sampled by the node.
///
/// Declaration order is the scan order of every wake-up and the order of
/// fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Air temperature in °C.
    Temperature,
    /// NO2 concentration in µg/m³.
    No2,
    /// Relative humidity in %.
    Humidity,
    /// Monotonic event counter.
    Counter,
}

impl Quantity {
    /// Every quantity in scan order.
    pub const ALL: [Quantity; 4] = [Quantity::Temperature, Quantity::No2, Quantity::Humidity, Quantity::Counter];

    /// Position in [`Quantity::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Presence bit of this quantity.
    pub fn presence(self) -> Presence {
        match self {
            Quantity::Temperature => Presence::TEMPERATURE,
            Quantity::No2 => Presence::NO2,
            Quantity::Humidity => Presence::HUMIDITY,
            Quantity::Counter => Presence::COUNTER,
        }
    }

    /// Whether firing increments a counter instead of sampling a reading.
    pub fn is_counter(self) -> bool {
        matches!(self, Quantity::Counter)
    }

    /// Lowercase name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::No2 => "no2",
            Quantity::Humidity => "humidity",
            Quantity::Counter => "counter",
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Presence bitmap of an outbound record, one bit per quantity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Presence: u8 {
        const TEMPERATURE = 0x01;
        const NO2 = 0x02;
        const HUMIDITY = 0x04;
        const COUNTER = 0x08;
    }
}

impl Presence {
    /// Number of present 8-byte float fields.
    pub fn float_fields(self) -> usize {
        (self - Presence::COUNTER).bits().count_ones() as usize
    }
}

/// Fixed-size table with one slot per [`Quantity`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityMap<T>([T; 4]);

impl<T> QuantityMap<T> {
    /// Build the table by calling `f` for each quantity in scan order.
    pub fn from_fn(mut f: impl FnMut(Quantity) -> T) -> Self {
        QuantityMap(std::array::from_fn(|i| f(Quantity::ALL[i])))
    }

    /// Iterate slots in scan order.
    pub fn iter(&self) -> impl Iterator<Item = (Quantity, &T)> {
        Quantity::ALL.into_iter().zip(self.0.iter())
    }

    /// Iterate slots mutably in scan order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Quantity, &mut T)> {
        Quantity::ALL.into_iter().zip(self.0.iter_mut())
    }
}

impl<T> Index<Quantity> for QuantityMap<T> {
    type Output = T;

    fn index(&self, q: Quantity) -> &T {
        &self.0[q.index()]
    }
}

impl<T> IndexMut<Quantity> for QuantityMap<T> {
    fn index_mut(&mut self, q: Quantity) -> &mut T {
        &mut self.0[q.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_bits() {
        let bits: Vec<u8> = Quantity::ALL.iter().map(|q| q.presence().bits()).collect();
        assert_eq!(bits, vec![0x01, 0x02, 0x04, 0x08]);
        assert_eq!((Presence::NO2 | Presence::HUMIDITY).bits(), 0x06);
        assert_eq!((Presence::all()).float_fields(), 3);
        assert_eq!(Presence::COUNTER.float_fields(), 0);
    }

    #[test]
    fn test_quantity_map_indexing() {
        let mut map = QuantityMap::from_fn(|q| q.index() * 10);
        assert_eq!(map[Quantity::Humidity], 20);
        map[Quantity::Counter] += 1;
        let values: Vec<usize> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 10, 20, 31]);
        assert!(Quantity::Counter.is_counter());
        assert!(!Quantity::No2.is_counter());
    }
}
