use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use super::read::bit_address;
use super::Reader;
use crate::errors::Result;
use crate::s7_protocol::address::AddressSpec;
use crate::s7_protocol::codec::get_bit;

#[derive(Debug)]
struct PLCBool {
    value: bool,
    last_known_value: bool,
}

impl PLCBool {
    fn new(start: bool) -> Self {
        Self {
            value: start,
            last_known_value: start,
        }
    }

    fn update(&mut self, new_value: bool) {
        self.last_known_value = self.value;
        self.value = new_value;
    }

    fn positive_flank(&self) -> bool {
        self.value && !self.last_known_value
    }

    fn negative_flank(&self) -> bool {
        !self.value && self.last_known_value
    }
}

/// Collection of observed `Bool` variables of the PLC
///
/// All bits are fetched with one batched read per [`update`](Self::update).
pub struct TriggerCollection<T, R>
where
    T: Hash + Eq,
{
    stored_values: HashMap<T, PLCBool>,
    bits: Vec<AddressSpec>,
    value_ids: Vec<T>,
    reader: R,
}

impl<T, R> Debug for TriggerCollection<T, R>
where
    T: Hash + Eq,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCollection")
            .field("observed plc values", &self.bits)
            .finish()
    }
}

impl<T, R> TriggerCollection<T, R>
where
    T: Hash + Eq + Clone + Send + Sync,
    R: Reader,
{
    /// Observe the bits at the given addresses through `reader`.
    ///
    /// Every trigger starts as `false`.
    /// # Errors
    ///
    /// Will return `Error::AddressFormat` if one of the addresses is not a bit address.
    pub fn new(reader: R, triggers: &[(T, &str)]) -> Result<Self> {
        let bits = triggers
            .iter()
            .map(|(_, address)| bit_address(address))
            .collect::<Result<Vec<_>>>()?;

        let value_ids: Vec<T> = triggers.iter().map(|(id, _)| id.to_owned()).collect();

        let stored_values = value_ids
            .iter()
            .map(|id| (id.to_owned(), PLCBool::new(false)))
            .collect();

        Ok(Self {
            stored_values,
            bits,
            value_ids,
            reader,
        })
    }

    /// Fetch the observed bits and shift the previous values into the flank history
    /// # Errors
    ///
    /// Will return `Error` if the `TriggerCollection` could not be updated. The
    /// stored values are left unchanged in that case.
    pub async fn update(&mut self) -> Result<()> {
        let covering: Vec<AddressSpec> = self.bits.iter().map(AddressSpec::covering_byte).collect();
        let bytes = self.reader.read_multi(&covering).await?;

        for ((bit, trigger_id), byte) in self.bits.iter().zip(&self.value_ids).zip(bytes) {
            if let Some(trigger) = self.stored_values.get_mut(trigger_id) {
                trigger.update(get_bit(&[byte], usize::from(bit.bit_index())));
            }
        }

        Ok(())
    }

    /// Whether `trigger` went from `false` to `true` with the last update.
    ///
    /// `None` if the trigger is not observed by this collection.
    pub fn positive_flank<Q>(&self, trigger: &Q) -> Option<bool>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.stored_values.get(trigger).map(PLCBool::positive_flank)
    }

    /// Whether `trigger` went from `true` to `false` with the last update.
    ///
    /// `None` if the trigger is not observed by this collection.
    pub fn negative_flank<Q>(&self, trigger: &Q) -> Option<bool>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.stored_values.get(trigger).map(PLCBool::negative_flank)
    }

    /// Current value of a trigger as of the last update
    pub fn value<Q>(&self, trigger: &Q) -> Option<bool>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.stored_values.get(trigger).map(|trigger| trigger.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flanks_follow_updates() {
        let mut bit = PLCBool::new(false);
        bit.update(true);
        assert!(bit.positive_flank());
        assert!(!bit.negative_flank());
        bit.update(true);
        assert!(!bit.positive_flank());
        bit.update(false);
        assert!(bit.negative_flank());
    }
}
