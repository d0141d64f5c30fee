//! Fan-out to named branches.
//!
//! Every value is dispatched to all branches in insertion order. Branches do
//! not back-pressure each other beyond running sequentially on the caller's
//! stack: a slow branch slows all branches.

use std::fmt::Display;

use indexmap::IndexMap;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, Operator};
use crate::store::StoreDescriptor;
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

pub struct Fork<In> {
    branches: IndexMap<String, BoxedOperator<In>>,
    telemetry: OperatorTelemetry,
}

impl<In: Data> Fork<In> {
    pub fn new() -> Self {
        Self {
            branches: IndexMap::new(),
            telemetry: OperatorTelemetry::unset(),
        }
    }

    pub fn add_branch(
        &mut self,
        name: impl Into<String>,
        head: BoxedOperator<In>,
    ) -> Result<(), StreamError> {
        let name = name.into();
        if self.branches.contains_key(&name) {
            return Err(StreamError::illegal(format!(
                "branch {name:?} already exists"
            )));
        }
        self.branches.insert(name, head);
        Ok(())
    }

    /// A fork has no single downstream; chains terminate here.
    pub fn set_next(&mut self, _next: BoxedOperator<In>) -> Result<(), StreamError> {
        Err(StreamError::illegal(
            "a fork dispatches to its branches and cannot have a downstream operator",
        ))
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.keys().cloned().collect()
    }
}

impl<In: Data> Default for Fork<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In> Display for Fork<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fork{{")?;
        for (i, name) in self.branches.keys().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}")?;
        }
        write!(f, "}}")
    }
}

impl<In: Data> Operator for Fork<In> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        for branch in self.branches.values_mut() {
            branch.start()?;
        }
        Ok(())
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let branches = &mut self.branches;
        self.telemetry.observe(|| {
            for branch in branches.values_mut() {
                branch.process(item.clone())?;
            }
            Ok(())
        })
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        for branch in self.branches.values_mut() {
            branch.stop()?;
        }
        Ok(())
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("fork", provider);
        for branch in self.branches.values_mut() {
            branch.set_telemetry_provider(provider);
        }
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        self.branches
            .values()
            .flat_map(|b| b.state_stores())
            .collect()
    }
}
