//! The application's watched tables, by module.

use realtime_change_stream::{ChangeKind, EventKinds, SubscriptionSpec};

use crate::error::{Error, Result};

/// Table backing the projects module.
pub const PROJECTS_TABLE: &str = "proyectos_registros";

/// A module's table and the change kinds it reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePreset {
   pub module: &'static str,
   pub table: &'static str,
   pub events: EventKinds,
}

const AUDIT_EVENTS: EventKinds = EventKinds::only(ChangeKind::Insert);

static PRESETS: [TablePreset; 6] = [
   TablePreset {
      module: "personas",
      table: "personas",
      events: EventKinds::all(),
   },
   TablePreset {
      module: "registros",
      table: "registros",
      events: EventKinds::all(),
   },
   TablePreset {
      module: "proyectos",
      table: PROJECTS_TABLE,
      events: EventKinds::all(),
   },
   TablePreset {
      module: "documentos_persona",
      table: "documentos_persona",
      events: EventKinds::all(),
   },
   TablePreset {
      module: "usuarios",
      table: "usuarios",
      events: EventKinds::all(),
   },
   // The audit log is append-only.
   TablePreset {
      module: "auditoria",
      table: "auditoria",
      events: AUDIT_EVENTS,
   },
];

impl TablePreset {
   pub fn all() -> &'static [TablePreset] {
      &PRESETS
   }

   pub fn find(module: &str) -> Result<&'static TablePreset> {
      PRESETS
         .iter()
         .find(|preset| preset.module == module)
         .ok_or_else(|| Error::UnknownPreset(module.to_string()))
   }

   pub fn spec(&self) -> SubscriptionSpec {
      SubscriptionSpec::new(self.table).with_events(self.events)
   }
}
