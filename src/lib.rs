//! bioptim: specification-checked parameter binding, genetic-algorithm
//! optimisation and Monte Carlo sensitivity analysis for bioprocess
//! facility models.
//!
//! A [`Facility`] is a tree of [`Component`]s whose parameters, inputs and
//! outputs live in [`SpecifiedMap`] containers that reject any value not
//! matching the field's [`Specification`]. An [`Optimiser`] searches over
//! declared variables of that tree; a [`SensitivityAnalyser`] perturbs them
//! and summarises the outputs. The analyser can itself be the optimiser's
//! target, so that each fitness evaluation is a full analysis.

pub mod config;
pub mod container;
pub mod dist;
pub mod error;
pub mod gen;
pub mod individual;
pub mod io;
pub mod logbook;
pub mod model;
pub mod nsga2;
pub mod optimiser;
pub mod selector;
pub mod sensitivity;
pub mod specs;
pub mod units;
pub mod value;


pub use config::{AnalyserParameters, OptimiserParameters, StudyConfig};
pub use container::SpecifiedMap;
pub use dist::Distribution;
pub use error::{Error, Result};
pub use gen::{Bound, FieldRef, Generator, GeneratorPolicy, RangeGen};
pub use individual::{Individual, Tracking, Variable, VariableDecl, MAX_REPAIR_PASSES};
pub use logbook::{GenerationRecord, Logbook};
pub use model::{Collection, Component, Facility, Process, ProcessSequence, Product, Role, Step};
pub use optimiser::{
    best_individuals, Direction, EvaluationTarget, Objective, Optimiser, OptimiserOutputs, Phase,
};
pub use selector::{ItemPath, Selector};
pub use sensitivity::{AnalysisOutputs, OutputSummary, SensitivityAnalyser};
pub use specs::{ColumnKind, SpecSet, Specification, TableSpec, ValueKind};
pub use units::{Quantity, Unit};
pub use value::{TableData, Value};
