use std::collections::{BTreeMap, HashMap};

use tracing::error;

use crate::codec::{build_registers, DataType, StateValue, Word};
use crate::error::Result;

pub use tokio_modbus::{Address, Quantity};

/// Modbus unit (slave) id.
pub type UnitId = u8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Sparse register block of one unit. Coils, discrete inputs, input and holding
/// registers all share it.
pub struct Registers(HashMap<Address, Word>);

impl Registers {
    /// Insert new consecutive registers with `words` values starting at `addr` address.
    pub fn insert(&mut self, addr: Address, words: Vec<Word>) {
        for (i, value) in words.into_iter().enumerate() {
            let reg_addr = addr.wrapping_add(i as Address);
            self.0.insert(reg_addr, value);
        }
    }

    pub fn get(&self, addr: Address) -> Option<Word> {
        self.0.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read `cnt` consecutive registers starting at `addr`.
    /// Addresses that were never registered read as zero.
    pub fn read(&self, addr: Address, cnt: Quantity) -> Vec<Word> {
        (0..cnt)
            .map(|i| self.get(addr.wrapping_add(i)).unwrap_or_default())
            .collect()
    }

    /// Read `cnt` consecutive registers as bits, a register is set when non-zero.
    pub fn read_bits(&self, addr: Address, cnt: Quantity) -> Vec<bool> {
        self.read(addr, cnt).into_iter().map(|word| word != 0).collect()
    }

    /// Write `words` into consecutive registers starting at `addr`, creating missing ones.
    pub fn write(&mut self, addr: Address, words: &[Word]) {
        self.insert(addr, words.to_vec());
    }

    pub fn write_bits(&mut self, addr: Address, bits: &[bool]) {
        self.insert(addr, bits.iter().map(|&bit| Word::from(bit)).collect());
    }
}

impl FromIterator<(Address, Word)> for Registers {
    fn from_iter<T: IntoIterator<Item = (Address, Word)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Resolved register values of every unit served by a virtual slave.
pub type AddressSpace = BTreeMap<UnitId, Registers>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One entity's contribution to the virtual slave's address space.
///
/// With a `bit_mask` the entry only owns the masked bits of its registers;
/// bit `n` of the mask belongs to register `address + n / 16`.
pub struct RegisterEntry {
    pub name: String,
    pub unit: UnitId,
    pub address: Address,
    pub registers: Vec<Word>,
    pub bit_mask: Option<u64>,
}

impl RegisterEntry {
    /// Entry owning whole registers, encoded from `state` with `data_type` over `count` registers.
    pub fn new(
        name: impl Into<String>,
        unit: UnitId,
        address: Address,
        state: &StateValue,
        data_type: DataType,
        count: Quantity,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            unit,
            address,
            registers: build_registers(state, data_type, count)?,
            bit_mask: None,
        })
    }

    /// Boolean entry. Without a mask it owns one whole register holding 1 or 0.
    pub fn boolean(
        name: impl Into<String>,
        unit: UnitId,
        address: Address,
        state: &StateValue,
        bit_mask: Option<u64>,
    ) -> Self {
        let on = state.is_truthy();
        let registers = match bit_mask {
            None => vec![Word::from(on)],
            Some(mask) => {
                let used_bits = (u64::BITS - mask.leading_zeros()).max(1);
                let word_cnt = used_bits.div_ceil(16) as usize;
                (0..word_cnt)
                    .map(|i| if on { (mask >> (16 * i)) as Word } else { 0 })
                    .collect()
            }
        };

        Self {
            name: name.into(),
            unit,
            address,
            registers,
            bit_mask,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Two entries claiming the same register, or the same bits of it.
pub struct Conflict {
    pub entity: String,
    pub unit: UnitId,
    pub address: Address,
    /// Overlapping bits, `None` for a whole-register conflict.
    pub mask: Option<Word>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    value: Word,
    used: Word,
}

/// Fold `entries` into one address map per unit.
///
/// The first entry to claim a register or bit keeps it; later claims are
/// dropped and reported as [`Conflict`]s.
pub fn fold_entries<'a>(
    entries: impl IntoIterator<Item = &'a RegisterEntry>) -> (AddressSpace, Vec<Conflict>,
) {
    let mut slots: BTreeMap<UnitId, HashMap<Address, Slot>> = BTreeMap::new();
    let mut conflicts = Vec::new();

    for entry in entries {
        let unit_slots = slots.entry(entry.unit).or_default();
        for (i, &word) in entry.registers.iter().enumerate() {
            let address = entry.address.wrapping_add(i as Address);
            match entry.bit_mask {
                None => {
                    if unit_slots.contains_key(&address) {
                        conflicts.push(Conflict {
                            entity: entry.name.clone(),
                            unit: entry.unit,
                            address,
                            mask: None,
                        });
                        continue;
                    }
                    unit_slots.insert(address, Slot { value: word, used: Word::MAX });
                }
                Some(mask) => {
                    let sub_mask = mask.checked_shr(16 * i as u32).unwrap_or(0) as Word;
                    if sub_mask == 0 {
                        continue;
                    }
                    let slot = unit_slots.entry(address).or_default();
                    let overlap = slot.used & sub_mask;
                    if overlap != 0 {
                        conflicts.push(Conflict {
                            entity: entry.name.clone(),
                            unit: entry.unit,
                            address,
                            mask: Some(overlap),
                        });
                    }
                    let free = sub_mask & !overlap;
                    let bits = if word != 0 { free } else { 0 };
                    slot.value |= bits;
                    slot.used |= free;
                }
            }
        }
    }

    let space = slots
        .into_iter()
        .map(|(unit, unit_slots)| {
            let registers = unit_slots
                .into_iter()
                .map(|(address, slot)| (address, slot.value))
                .collect::<Registers>();
            (unit, registers)
        })
        .collect();

    (space, conflicts)
}

/// Build the serving address space from `entries`, logging every conflict.
pub fn build_server_blocks(entries: &[RegisterEntry]) -> AddressSpace {
    let (space, conflicts) = fold_entries(entries);
    for conflict in &conflicts {
        match conflict.mask {
            None => error!(
                entity = %conflict.entity,
                unit = conflict.unit,
                address = conflict.address,
                "register already in use, value dropped"
            ),
            Some(mask) => error!(
                entity = %conflict.entity,
                unit = conflict.unit,
                address = conflict.address,
                mask = format_args!("{mask:#06x}"),
                "bits already in use, overlapping bits dropped"
            ),
        }
    }
    space
}
