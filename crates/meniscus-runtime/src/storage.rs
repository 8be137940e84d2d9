//! Solution storage for time-stepping simulations.
//!
//! The external solver works on one buffer of unknowns per *subproblem*
//! (a group of fields solved together in one coupled system). Storage
//! keeps two generations of every buffer: `current` (the time level
//! being computed) and `previous` (the last completed level), which is
//! exactly the pair a checkpoint persists and a restart restores.
//!
//! # Step Lifecycle
//!
//! 1. The solver reads `previous`, writes `current`.
//! 2. Persistence reads both generations (snapshot, checkpoint).
//! 3. [`SolutionStorage::advance_step`] copies `current` into
//!    `previous` for the next step.
//!
//! # Buffer Layout
//!
//! A subproblem buffer is a flat `f64` shard owned by one rank. Inside
//! it, each declared field occupies one contiguous block of
//! `components * points` values, in declaration order, where `points`
//! is the per-rank point count shared by all fields of the subproblem.
//! [`SubproblemLayout::component_slice`] recovers a single field's
//! block for snapshot extraction.

use indexmap::IndexMap;

/// One named field inside a subproblem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    /// Field name; also the stem of dataset keys and series file names.
    pub name: String,
    /// Values per point (1 for scalars, `dim` for vectors).
    pub components: usize,
}

impl FieldDecl {
    /// Declare a scalar field.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: 1,
        }
    }

    /// Declare a vector field with the given component count.
    pub fn vector(name: impl Into<String>, components: usize) -> Self {
        Self {
            name: name.into(),
            components,
        }
    }
}

/// Which fields make up each subproblem, in solve order.
#[derive(Debug, Clone, Default)]
pub struct SubproblemLayout {
    subproblems: IndexMap<String, Vec<FieldDecl>>,
}

impl SubproblemLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a subproblem and its fields.
    pub fn declare(&mut self, subproblem: impl Into<String>, fields: Vec<FieldDecl>) {
        self.subproblems.insert(subproblem.into(), fields);
    }

    /// The fields of one subproblem.
    pub fn fields(&self, subproblem: &str) -> Option<&[FieldDecl]> {
        self.subproblems.get(subproblem).map(Vec::as_slice)
    }

    /// Iterate `(subproblem, fields)` in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &[FieldDecl])> {
        self.subproblems.iter().map(|(name, f)| (name, f.as_slice()))
    }

    /// Every declared field name, in declaration order across
    /// subproblems.
    pub fn field_names(&self) -> Vec<String> {
        self.subproblems
            .values()
            .flatten()
            .map(|f| f.name.clone())
            .collect()
    }

    /// Total components per point of one subproblem's buffer.
    pub fn total_components(&self, subproblem: &str) -> Option<usize> {
        self.fields(subproblem)
            .map(|fields| fields.iter().map(|f| f.components).sum())
    }

    /// The contiguous block of `buffer` holding one field of a
    /// subproblem.
    ///
    /// Returns `None` for an unknown subproblem or field, or when the
    /// buffer length is not a multiple of the subproblem's component
    /// total.
    pub fn component_slice<'a>(
        &self,
        subproblem: &str,
        field: &str,
        buffer: &'a [f64],
    ) -> Option<&'a [f64]> {
        let fields = self.fields(subproblem)?;
        let total: usize = fields.iter().map(|f| f.components).sum();
        if total == 0 || buffer.len() % total != 0 {
            return None;
        }
        let points = buffer.len() / total;
        let mut offset = 0;
        for decl in fields {
            let len = decl.components * points;
            if decl.name == field {
                return Some(&buffer[offset..offset + len]);
            }
            offset += len;
        }
        None
    }
}

/// Double-buffered per-subproblem solution shards.
///
/// # Example
///
/// ```
/// use meniscus_runtime::storage::SolutionStorage;
///
/// let mut state = SolutionStorage::new();
/// state.init("flow", vec![0.0; 4]);
///
/// state.current_mut("flow").unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(state.previous("flow").unwrap(), &[0.0; 4]);
///
/// state.advance_step();
/// assert_eq!(state.previous("flow").unwrap(), &[1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SolutionStorage {
    current: IndexMap<String, Vec<f64>>,
    previous: IndexMap<String, Vec<f64>>,
}

impl SolutionStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subproblem with its initial local shard; both
    /// generations start from it.
    pub fn init(&mut self, subproblem: impl Into<String>, values: Vec<f64>) {
        let name = subproblem.into();
        self.previous.insert(name.clone(), values.clone());
        self.current.insert(name, values);
    }

    /// Subproblem names in registration order.
    pub fn subproblem_names(&self) -> Vec<String> {
        self.current.keys().cloned().collect()
    }

    /// Current-generation shard.
    pub fn current(&self, subproblem: &str) -> Option<&[f64]> {
        self.current.get(subproblem).map(Vec::as_slice)
    }

    /// Previous-generation shard.
    pub fn previous(&self, subproblem: &str) -> Option<&[f64]> {
        self.previous.get(subproblem).map(Vec::as_slice)
    }

    /// Mutable current-generation shard (the solver writes here).
    pub fn current_mut(&mut self, subproblem: &str) -> Option<&mut [f64]> {
        self.current.get_mut(subproblem).map(Vec::as_mut_slice)
    }

    /// Mutable previous-generation shard (restores write here).
    pub fn previous_mut(&mut self, subproblem: &str) -> Option<&mut [f64]> {
        self.previous.get_mut(subproblem).map(Vec::as_mut_slice)
    }

    /// Copy `current` into `previous` after a completed step.
    pub fn advance_step(&mut self) {
        for (name, current) in &self.current {
            if let Some(previous) = self.previous.get_mut(name) {
                previous.copy_from_slice(current);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_seeds_both_generations() {
        let mut state = SolutionStorage::new();
        state.init("phase", vec![0.5, 0.5]);
        assert_eq!(state.current("phase").unwrap(), &[0.5, 0.5]);
        assert_eq!(state.previous("phase").unwrap(), &[0.5, 0.5]);
    }

    #[test]
    fn test_advance_step_copies_current() {
        let mut state = SolutionStorage::new();
        state.init("phase", vec![0.0, 0.0]);
        state.current_mut("phase").unwrap()[0] = 9.0;
        state.advance_step();
        assert_eq!(state.previous("phase").unwrap(), &[9.0, 0.0]);
        // Current is untouched; the next solve overwrites it.
        assert_eq!(state.current("phase").unwrap(), &[9.0, 0.0]);
    }

    #[test]
    fn test_component_slice_blocked_layout() {
        let mut layout = SubproblemLayout::new();
        layout.declare(
            "flow",
            vec![FieldDecl::vector("u", 2), FieldDecl::scalar("p")],
        );

        // 3 points: u occupies 6 values, p the trailing 3.
        let buffer: Vec<f64> = (0..9).map(f64::from).collect();
        assert_eq!(
            layout.component_slice("flow", "u", &buffer).unwrap(),
            &buffer[0..6]
        );
        assert_eq!(
            layout.component_slice("flow", "p", &buffer).unwrap(),
            &buffer[6..9]
        );
        assert!(layout.component_slice("flow", "phi", &buffer).is_none());
        assert!(layout.component_slice("other", "u", &buffer).is_none());
    }

    #[test]
    fn test_component_slice_rejects_ragged_buffer() {
        let mut layout = SubproblemLayout::new();
        layout.declare("flow", vec![FieldDecl::vector("u", 2)]);
        let buffer = vec![0.0; 5];
        assert!(layout.component_slice("flow", "u", &buffer).is_none());
    }

    #[test]
    fn test_field_names_cross_subproblem_order() {
        let mut layout = SubproblemLayout::new();
        layout.declare("npw", vec![FieldDecl::scalar("phi")]);
        layout.declare(
            "flow",
            vec![FieldDecl::vector("u", 2), FieldDecl::scalar("p")],
        );
        assert_eq!(layout.field_names(), vec!["phi", "u", "p"]);
    }
}
