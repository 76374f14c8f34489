//! Product port descriptors.
//!
//! Sources and stages declare which named, typed products they read from and
//! write into an [`Event`](crate::pool::Event). The topology builder uses
//! these to reject stages whose inputs nothing upstream produces.

use std::any::type_name;

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Descriptor for one product a stage consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub direction: PortDirection,
    /// `std::any::type_name` of the product type
    pub type_name: &'static str,
}

impl PortDescriptor {
    pub fn input<T: 'static>(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            type_name: type_name::<T>(),
        }
    }

    pub fn output<T: 'static>(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            type_name: type_name::<T>(),
        }
    }

    /// True when `self` (an input) is satisfied by `other` (an output)
    pub fn accepts(&self, other: &PortDescriptor) -> bool {
        self.direction == PortDirection::Input
            && other.direction == PortDirection::Output
            && self.name == other.name
            && self.type_name == other.type_name
    }
}
