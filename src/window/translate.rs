//! Displacement to address translation

use super::registration::Window;

/// Resolves `(target rank, displacement)` pairs to addresses
pub struct AddressTranslator;

impl AddressTranslator {
    /// `base[target] + disp_unit[target] * displacement`.
    ///
    /// No bounds checking; ranks and displacements are validated upstream.
    pub fn resolve(window: &Window, target: usize, displacement: i64) -> u64 {
        let entry = window.entry(target);
        let offset = (entry.disp_unit as i64).wrapping_mul(displacement);
        entry.base.wrapping_add_signed(offset)
    }

    /// Address of the accumulate lock word of `target`
    pub fn lock_addr(window: &Window, target: usize) -> u64 {
        window.entry(target).state_addr
    }
}
