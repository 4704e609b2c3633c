//! Tiered digram grammar induction.
//!
//! Each tier counts every adjacent ordered pair of symbols, picks the most frequent pair, and
//! rewrites its non-overlapping occurrences left to right into a fresh rule symbol. Rule symbols
//! are negative (`-1`, `-2`, ...) so they never collide with terminals. Induction is pure and
//! synchronous; the sequence lives in an [`Arena`] of doubly linked cells so a rewrite is O(1)
//! per occurrence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strata_runtime::CancelToken;
use tracing::{debug, trace};

use crate::error::InduceError;

const NIL: usize = usize::MAX;

/// Induction limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InducerConfig {
    /// A digram must occur at least this often (overlaps included) to become a rule.
    pub min_occurrences: u32,
    /// Upper bound on tiers, and therefore on rules.
    pub max_tiers: u32,
}

impl Default for InducerConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 2,
            max_tiers: 30,
        }
    }
}

/// One grammar rule: `rule_id -> left right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Negative rule symbol
    pub rule_id: i64,
    /// Left symbol (terminal or earlier rule)
    pub left: i64,
    /// Right symbol (terminal or earlier rule)
    pub right: i64,
    /// Tier that created the rule, from 1
    pub tier: u32,
}

/// Result of one induction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Induction {
    /// Rewritten top-level sequence
    pub final_sequence: Vec<i64>,
    /// Rules in creation order; every rule references only terminals and earlier rules
    pub rules: Vec<Rule>,
}

impl Induction {
    /// Number of tiers that produced a rule.
    pub fn tier_count(&self) -> u32 {
        self.rules.last().map_or(0, |r| r.tier)
    }

    /// Expand the final sequence back into terminals.
    pub fn expand(&self) -> Vec<i64> {
        let by_id: HashMap<i64, &Rule> = self.rules.iter().map(|r| (r.rule_id, r)).collect();
        let mut out = Vec::new();
        let mut stack: Vec<i64> = self.final_sequence.iter().rev().copied().collect();
        while let Some(symbol) = stack.pop() {
            match by_id.get(&symbol) {
                Some(rule) => {
                    stack.push(rule.right);
                    stack.push(rule.left);
                }
                None => out.push(symbol),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    value: i64,
    prev: usize,
    next: usize,
    live: bool,
}

/// Reusable scratch for induction: linked cells plus the digram table.
#[derive(Debug)]
pub struct Arena {
    cells: Vec<Cell>,
    head: usize,
    live: usize,
    digrams: HashMap<(i64, i64), (u32, u32)>,
}

impl Arena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an arena pre-sized for `n` symbols.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            cells: Vec::with_capacity(n),
            head: NIL,
            live: 0,
            digrams: HashMap::with_capacity(n.min(1 << 16)),
        }
    }

    /// Forget the current sequence, keeping allocations.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.digrams.clear();
        self.head = NIL;
        self.live = 0;
    }

    /// Forget the current sequence and release storage beyond `retain_cells` slots.
    pub fn reset(&mut self, retain_cells: usize) {
        self.clear();
        if self.cells.capacity() > retain_cells {
            self.cells.shrink_to(retain_cells);
        }
        let retain_digrams = retain_cells.min(1 << 16);
        if self.digrams.capacity() > retain_digrams {
            self.digrams.shrink_to(retain_digrams);
        }
    }

    /// Digram slots currently allocated.
    pub fn digram_capacity(&self) -> usize {
        self.digrams.capacity()
    }

    /// Replace the contents with `symbols`.
    pub fn load(&mut self, symbols: &[i64]) {
        self.clear();
        let n = symbols.len();
        self.cells.extend(symbols.iter().enumerate().map(|(i, &value)| Cell {
            value,
            prev: if i == 0 { NIL } else { i - 1 },
            next: if i + 1 == n { NIL } else { i + 1 },
            live: true,
        }));
        self.head = if n == 0 { NIL } else { 0 };
        self.live = n;
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.live
    }

    /// True if no live cells remain.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocated cell slots, live or tombstoned.
    pub fn capacity(&self) -> usize {
        self.cells.capacity()
    }

    /// Live symbols in order.
    pub fn to_vec(&self) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.live);
        let mut cur = self.head;
        while cur != NIL {
            out.push(self.cells[cur].value);
            cur = self.cells[cur].next;
        }
        out
    }

    /// Count every adjacent pair and return the winner: highest count, earliest first
    /// occurrence on ties.
    fn best_digram(&mut self) -> Option<((i64, i64), u32)> {
        self.digrams.clear();
        let mut ordinal = 0u32;
        let mut cur = self.head;
        while cur != NIL {
            let next = self.cells[cur].next;
            if next == NIL {
                break;
            }
            let key = (self.cells[cur].value, self.cells[next].value);
            let entry = self.digrams.entry(key).or_insert_with(|| {
                ordinal += 1;
                (0, ordinal)
            });
            entry.0 += 1;
            cur = next;
        }
        self.digrams
            .iter()
            .max_by(|(_, (ca, oa)), (_, (cb, ob))| ca.cmp(cb).then(ob.cmp(oa)))
            .map(|(&key, &(count, _))| (key, count))
    }

    /// Rewrite non-overlapping occurrences of `digram`, scanning left to right.
    fn replace(&mut self, digram: (i64, i64), rule_id: i64) -> usize {
        let (left, right) = digram;
        let mut replaced = 0;
        let mut cur = self.head;
        while cur != NIL {
            let next = self.cells[cur].next;
            if next == NIL {
                break;
            }
            debug_assert!(self.cells[next].live && self.cells[next].prev == cur);
            if self.cells[cur].value == left && self.cells[next].value == right {
                let after = self.cells[next].next;
                self.cells[cur].value = rule_id;
                self.cells[cur].next = after;
                if after != NIL {
                    self.cells[after].prev = cur;
                }
                self.cells[next].live = false;
                self.live -= 1;
                replaced += 1;
                cur = after;
            } else {
                cur = next;
            }
        }
        replaced
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// Digram-replacement grammar inducer.
#[derive(Debug, Clone, Default)]
pub struct GrammarInducer {
    config: InducerConfig,
}

impl GrammarInducer {
    /// Create an inducer with the given limits.
    pub fn new(config: InducerConfig) -> Self {
        Self { config }
    }

    /// The limits in use.
    pub fn config(&self) -> &InducerConfig {
        &self.config
    }

    /// Induce a grammar over `symbols` using a fresh arena.
    pub fn induce(&self, symbols: &[i64], token: &CancelToken) -> Result<Induction, InduceError> {
        let mut arena = Arena::with_capacity(symbols.len());
        self.induce_with(symbols, &mut arena, token)
    }

    /// Induce a grammar over `symbols`, reusing `arena` as scratch. The token is checked before
    /// every tier.
    pub fn induce_with(
        &self,
        symbols: &[i64],
        arena: &mut Arena,
        token: &CancelToken,
    ) -> Result<Induction, InduceError> {
        self.induce_observed(symbols, arena, token, &mut |_| {})
    }

    fn induce_observed(
        &self,
        symbols: &[i64],
        arena: &mut Arena,
        token: &CancelToken,
        on_rule: &mut dyn FnMut(&Rule),
    ) -> Result<Induction, InduceError> {
        if let Some(index) = symbols.iter().position(|&s| s < 0) {
            return Err(InduceError::NotTerminal {
                symbol: symbols[index],
                index,
            });
        }
        arena.load(symbols);
        let min_occurrences = self.config.min_occurrences.max(1);
        let mut rules = Vec::new();

        for tier in 1..=self.config.max_tiers {
            if let Err(cancelled) = token.check() {
                return Err(InduceError::Cancelled {
                    tier,
                    reason: cancelled.0,
                });
            }
            let Some((digram, count)) = arena.best_digram() else {
                break;
            };
            if count < min_occurrences {
                trace!(tier, count, "no digram reaches the threshold");
                break;
            }
            let rule_id = -(rules.len() as i64) - 1;
            let replaced = arena.replace(digram, rule_id);
            if replaced == 0 {
                break;
            }
            trace!(tier, rule_id, left = digram.0, right = digram.1, count, replaced, "rule");
            let rule = Rule {
                rule_id,
                left: digram.0,
                right: digram.1,
                tier,
            };
            on_rule(&rule);
            rules.push(rule);
        }

        let induction = Induction {
            final_sequence: arena.to_vec(),
            rules,
        };
        debug!(
            input = symbols.len(),
            rules = induction.rules.len(),
            final_len = induction.final_sequence.len(),
            "grammar induced"
        );
        Ok(induction)
    }
}
