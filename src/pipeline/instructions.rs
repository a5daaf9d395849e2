//! Instruction tree flattening
//!
//! A transaction reports its call tree in two pieces: the outer instructions
//! listed in the message, and the inner instructions recorded by the runtime,
//! grouped by the index of the outer instruction that triggered them. The
//! builder merges them into one sequence where each outer instruction is
//! immediately followed by its own inner group.
//!
//! The result always has `outer.len() + sum(group lengths)` entries and keeps
//! the outer instructions in their original order.

use std::collections::HashMap;

use super::errors::BuildError;
use super::source::{RawInnerInstruction, RawInnerInstructions, RawOuterInstruction};
use crate::types::Instruction;

/// Stack height of every outer instruction
pub const OUTER_STACK_HEIGHT: u32 = 1;

/// How inner instruction depths are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackHeightCheck {
    /// Depths are copied as reported, a missing depth stays missing
    #[default]
    Relaxed,
    /// Require every depth to be present, at least 2, and to grow by at
    /// most one level relative to the previous instruction of the group
    Strict,
}

/// Flattens outer and inner instructions into one ordered sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionTreeBuilder {
    check: StackHeightCheck,
}

impl InstructionTreeBuilder {
    pub fn new(check: StackHeightCheck) -> Self {
        Self { check }
    }

    pub fn strict() -> Self {
        Self::new(StackHeightCheck::Strict)
    }

    pub fn check(&self) -> StackHeightCheck {
        self.check
    }

    /// Build the flattened instruction sequence
    pub fn build(
        &self,
        outer: &[RawOuterInstruction],
        inner_groups: &[RawInnerInstructions],
    ) -> Result<Vec<Instruction>, BuildError> {
        let groups = index_groups(outer.len(), inner_groups)?;
        let total = outer.len() + inner_groups.iter().map(|g| g.instructions.len()).sum::<usize>();
        let mut flattened = Vec::with_capacity(total);

        for (outer_index, outer_ix) in outer.iter().enumerate() {
            if let Some(stack_height) = outer_ix.stack_height {
                return Err(BuildError::OuterInstructionUnexpectedDepth {
                    outer_index,
                    stack_height,
                    instruction: outer_ix.clone(),
                });
            }

            flattened.push(Instruction {
                stack_height: Some(OUTER_STACK_HEIGHT),
                program_id_index: outer_ix.program_id_index,
                data: outer_ix.data.to_base58(),
                accounts: outer_ix.accounts.clone(),
            });

            let Some(group) = groups.get(&outer_index) else {
                continue;
            };
            self.push_group(outer_index, group, &mut flattened)?;
        }

        Ok(flattened)
    }

    fn push_group(
        &self,
        outer_index: usize,
        group: &[RawInnerInstruction],
        flattened: &mut Vec<Instruction>,
    ) -> Result<(), BuildError> {
        let mut prior = OUTER_STACK_HEIGHT;
        for (inner_index, inner_ix) in group.iter().enumerate() {
            let transition_error = |inner_stack_height| BuildError::InvalidDepthTransition {
                outer_index,
                inner_index,
                prior_stack_height: prior,
                inner_stack_height,
            };

            if self.check == StackHeightCheck::Strict {
                match inner_ix.stack_height {
                    Some(height) if is_valid_transition(prior, height) => {}
                    other => return Err(transition_error(other)),
                }
            }

            flattened.push(Instruction {
                stack_height: inner_ix.stack_height,
                program_id_index: inner_ix.program_id_index,
                data: inner_ix.data.to_base58(),
                accounts: inner_ix.accounts.clone(),
            });
            if let Some(height) = inner_ix.stack_height {
                prior = height;
            }
        }
        Ok(())
    }
}

/// Inner depth may drop back to any level, but may only rise one step at a
/// time and never reaches the outer level
fn is_valid_transition(prior: u32, next: u32) -> bool {
    next > OUTER_STACK_HEIGHT && (next <= prior || next == prior + 1)
}

fn index_groups(
    outer_count: usize,
    inner_groups: &[RawInnerInstructions],
) -> Result<HashMap<usize, &[RawInnerInstruction]>, BuildError> {
    let mut groups = HashMap::with_capacity(inner_groups.len());
    for group in inner_groups {
        let index = usize::from(group.index);
        if groups.insert(index, group.instructions.as_slice()).is_some() {
            return Err(BuildError::RepeatedOuterIndexForInnerGroup {
                repeated_index: group.index,
            });
        }
    }
    if let Some(orphan) = inner_groups
        .iter()
        .find(|group| usize::from(group.index) >= outer_count)
    {
        return Err(BuildError::InnerGroupWithoutOuter {
            index: orphan.index,
            outer_count,
        });
    }
    Ok(groups)
}
