//! Slots
//!
//! A slot is a named, typed data table acting as a node's input or output
//! channel. Whether a slot is optional decides if a missing contribution
//! marks an iteration step as incomplete.

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    annotation::merge::{DataMergeMode, TextMergeMode},
    data::TypeTag,
    progress::Progress,
    table::DataTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotRole {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    name: String,
    accepted: TypeTag,
    role: SlotRole,
    optional: bool,
}

impl SlotInfo {
    pub fn input(name: impl Into<String>, accepted: TypeTag) -> Self {
        Self {
            name: name.into(),
            accepted,
            role: SlotRole::Input,
            optional: false,
        }
    }

    pub fn output(name: impl Into<String>, accepted: TypeTag) -> Self {
        Self {
            name: name.into(),
            accepted,
            role: SlotRole::Output,
            optional: false,
        }
    }

    /// Mark the slot as optional: iteration steps missing a contribution
    /// from it are not flagged incomplete.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted(&self) -> TypeTag {
        self.accepted
    }

    pub fn role(&self) -> SlotRole {
        self.role
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

#[derive(Debug)]
pub struct Slot {
    info: SlotInfo,
    table: DataTable,
}

impl Slot {
    pub fn new(info: SlotInfo) -> Self {
        let table = DataTable::new(info.accepted());
        Self { info, table }
    }

    /// Wrap an existing table, for example one taken from the cache.
    pub fn with_table(info: SlotInfo, table: DataTable) -> Self {
        Self { info, table }
    }

    pub fn info(&self) -> &SlotInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn is_optional(&self) -> bool {
        self.info.is_optional()
    }

    pub fn table(&self) -> &DataTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut DataTable {
        &mut self.table
    }

    pub fn into_table(self) -> DataTable {
        self.table
    }

    /// Copy every row of another slot into this one, annotations included.
    pub fn add_data_from_slot(
        &mut self,
        other: &Slot,
        text_mode: TextMergeMode,
        data_mode: DataMergeMode,
        progress: &Progress,
    ) -> Result<(), Error> {
        let progress = progress.resolve(&format!(
            "{} <- {}",
            self.display_name(),
            other.display_name()
        ));
        self.table
            .add_data_from_table(other.table(), text_mode, data_mode, &progress)
    }

    pub fn display_name(&self) -> String {
        let role = match self.info.role() {
            SlotRole::Input => "input",
            SlotRole::Output => "output",
        };
        format!("{} ({role})", self.info.name())
    }
}
