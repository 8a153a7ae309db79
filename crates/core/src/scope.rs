//! Symbol/scope table: a stack of lexical frames.
//!
//! Every declaration gets a fresh `SymbolId` that stays valid after its frame
//! is popped, so compiled code can keep referring to it. Only *name lookup*
//! is scoped: once a frame is popped its names are unreachable.

use crate::types::ValueType;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Action input parameter.
    Param,
    /// A field of the owning entity, read from the current record.
    EntityField,
    /// `Declare` step.
    Local,
    /// Introduced by a query-family step (`into`).
    QueryBinding,
    /// Per-iteration loop variable.
    Iterator,
    Cursor,
    /// A relation name bound inside a recursive CTE term.
    Relation,
    /// Implicit binding such as `error_message` inside a catch clause.
    Implicit,
    /// Compiler-introduced temporary (fallback lowerings).
    Temp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub mutable: bool,
    pub nullable: bool,
    pub kind: SymbolKind,
    /// Frame depth at declaration; 0 is the action root frame.
    pub depth: usize,
}

/// How a new binding behaves; `declare` uses the local-variable defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingMode {
    pub mutable: bool,
    pub nullable: bool,
    pub kind: SymbolKind,
}

impl BindingMode {
    pub fn local(mutable: bool) -> Self {
        BindingMode {
            mutable,
            nullable: true,
            kind: SymbolKind::Local,
        }
    }

    pub fn readonly(kind: SymbolKind) -> Self {
        BindingMode {
            mutable: false,
            nullable: true,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },
    #[error("'{name}' is already declared in this scope")]
    DuplicateDeclaration { name: String },
    #[error("cannot pop the root scope")]
    PopRootFrame,
}

/// All symbols declared while compiling one action, indexed by `SymbolId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Add a symbol outside of any scope discipline (used by lowerings
    /// that introduce temporaries after compilation).
    pub fn push_temp(&mut self, name: &str, ty: ValueType) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            id,
            name: name.to_owned(),
            ty,
            mutable: true,
            nullable: true,
            kind: SymbolKind::Temp,
            depth: 1,
        });
        id
    }
}

#[derive(Debug, Default)]
struct Frame {
    bindings: BTreeMap<String, SymbolId>,
}

#[derive(Debug)]
pub struct ScopeTable {
    table: SymbolTable,
    frames: Vec<Frame>,
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTable {
    /// A table with a single (root) frame.
    pub fn new() -> Self {
        ScopeTable {
            table: SymbolTable::default(),
            frames: vec![Frame::default()],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn push(&mut self) {
        self.frames.push(Frame::default());
        trace!(depth = self.depth(), "scope push");
    }

    pub fn pop(&mut self) -> Result<(), ScopeError> {
        if self.frames.len() <= 1 {
            return Err(ScopeError::PopRootFrame);
        }
        self.frames.pop();
        trace!(depth = self.depth(), "scope pop");
        Ok(())
    }

    /// Pop frames until the table is back at `depth`.
    pub fn truncate(&mut self, depth: usize) {
        while self.depth() > depth {
            self.frames.pop();
        }
    }

    pub fn declare(
        &mut self,
        name: &str,
        ty: ValueType,
        mutable: bool,
    ) -> Result<SymbolId, ScopeError> {
        self.declare_with(name, ty, BindingMode::local(mutable))
    }

    /// Declare into the current frame. Shadowing an outer frame is allowed;
    /// redeclaring within the same frame is not.
    pub fn declare_with(
        &mut self,
        name: &str,
        ty: ValueType,
        mode: BindingMode,
    ) -> Result<SymbolId, ScopeError> {
        let depth = self.depth();
        let id = SymbolId(self.table.symbols.len() as u32);
        // frames is never empty: the root frame cannot be popped
        let frame = self
            .frames
            .last_mut()
            .ok_or(ScopeError::PopRootFrame)?;
        if frame.bindings.contains_key(name) {
            return Err(ScopeError::DuplicateDeclaration {
                name: name.to_owned(),
            });
        }
        frame.bindings.insert(name.to_owned(), id);
        self.table.symbols.push(Symbol {
            id,
            name: name.to_owned(),
            ty,
            mutable: mode.mutable,
            nullable: mode.nullable,
            kind: mode.kind,
            depth,
        });
        Ok(id)
    }

    /// Innermost visible declaration of `name`.
    pub fn resolve(&self, name: &str) -> Result<&Symbol, ScopeError> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.bindings.get(name))
            .map(|id| self.table.get(*id))
            .ok_or_else(|| ScopeError::UnknownVariable {
                name: name.to_owned(),
            })
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        self.table.get(id)
    }

    /// Refine the type of a binding whose type was not known at declaration.
    pub fn refine(&mut self, id: SymbolId, ty: ValueType) {
        self.table.symbols[id.index()].ty = ty;
    }

    pub fn into_symbols(self) -> SymbolTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_searches_outward() {
        let mut scopes = ScopeTable::new();
        scopes.declare("x", ValueType::integer(), true).unwrap();
        scopes.push();
        assert_eq!(scopes.resolve("x").unwrap().ty, ValueType::integer());
    }

    #[test]
    fn duplicate_in_same_frame_fails() {
        let mut scopes = ScopeTable::new();
        scopes.declare("x", ValueType::integer(), true).unwrap();
        let err = scopes.declare("x", ValueType::text(), true).unwrap_err();
        assert_eq!(
            err,
            ScopeError::DuplicateDeclaration { name: "x".into() }
        );
    }

    #[test]
    fn shadowing_outer_frame_is_allowed() {
        let mut scopes = ScopeTable::new();
        let outer = scopes.declare("x", ValueType::integer(), true).unwrap();
        scopes.push();
        let inner = scopes.declare("x", ValueType::text(), true).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(scopes.resolve("x").unwrap().id, inner);
        scopes.pop().unwrap();
        assert_eq!(scopes.resolve("x").unwrap().id, outer);
    }

    #[test]
    fn popped_bindings_are_unreachable() {
        let mut scopes = ScopeTable::new();
        scopes.push();
        scopes.declare("tmp", ValueType::integer(), true).unwrap();
        scopes.pop().unwrap();
        assert!(matches!(
            scopes.resolve("tmp"),
            Err(ScopeError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn root_frame_cannot_be_popped() {
        let mut scopes = ScopeTable::new();
        assert_eq!(scopes.pop(), Err(ScopeError::PopRootFrame));
    }

    #[test]
    fn symbol_ids_survive_pop() {
        let mut scopes = ScopeTable::new();
        scopes.push();
        let id = scopes.declare("y", ValueType::boolean(), false).unwrap();
        scopes.pop().unwrap();
        let table = scopes.into_symbols();
        assert_eq!(table.get(id).name, "y");
        assert_eq!(table.get(id).depth, 1);
        assert!(!table.get(id).mutable);
    }
}
