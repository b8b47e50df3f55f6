// SPDX-License-Identifier: GPL-3.0-or-later

//! Command attribute table.
//!
//! The broker never hardcodes which commands exist or how many handles
//! they carry; it asks the TPM once at startup through
//! `TPM2_GetCapability(TPM_CAP_COMMANDS)` and keeps the returned
//! `TPMA_CC` words here. A command code missing from the table is one
//! the TPM does not implement.

use std::collections::HashMap;
use tpm2_proto::CommandAttributes;

/// Vendor command codes have bit 29 set in `TPM_CC` as well as in the
/// attribute word.
const CC_VENDOR: u32 = 1 << 29;

pub struct CommandAttrsTable {
    attrs: HashMap<u32, CommandAttributes>,
}

impl CommandAttrsTable {
    /// Build the table from raw `TPMA_CC` words. The command code each
    /// word describes is reconstructed from its `commandIndex` and `V`
    /// fields.
    #[must_use]
    pub fn new(words: impl IntoIterator<Item = u32>) -> CommandAttrsTable {
        let mut attrs = HashMap::new();
        for word in words {
            let a = CommandAttributes::from_bits_retain(word);
            let mut code = u32::from(a.command_index());
            if a.contains(CommandAttributes::V) {
                code |= CC_VENDOR;
            }
            attrs.insert(code, a);
        }
        CommandAttrsTable { attrs }
    }

    /// Attributes for `code`, `None` when the TPM does not implement it.
    #[must_use]
    pub fn lookup(&self, code: u32) -> Option<CommandAttributes> {
        self.attrs.get(&code).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_command_codes() {
        // CreatePrimary: one handle, response handle.
        let table = CommandAttrsTable::new([0x1200_0131, 0x0000_017A]);
        assert_eq!(table.len(), 2);

        let attrs = table.lookup(0x0000_0131).unwrap();
        assert_eq!(attrs.handle_count(), 1);
        assert!(attrs.has_response_handle());

        let attrs = table.lookup(0x0000_017A).unwrap();
        assert_eq!(attrs.handle_count(), 0);
        assert!(!attrs.has_response_handle());

        assert_eq!(table.lookup(0x0000_0999), None);
    }

    #[test]
    fn vendor_bit_lands_in_the_code() {
        let table = CommandAttrsTable::new([0x2000_0001]);
        assert!(table.lookup(0x2000_0001).is_some());
        assert_eq!(table.lookup(0x0000_0001), None);
    }
}
