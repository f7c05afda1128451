//! Function-level optimizer pipeline, run to a fixpoint.

use super::interp::compare;
use super::ir::{FunctionDef, InstId, InstKind, Operand, OperandKey, Terminator};
use super::{ArithOp, Predicate};
use std::collections::HashMap;
use tracing::trace;

const MAX_ROUNDS: usize = 8;

type Replacements = HashMap<usize, Operand>;

pub(crate) fn run(def: &mut FunctionDef) {
    for round in 0..MAX_ROUNDS {
        let mut changed = fold_constants(def);
        changed |= eliminate_common_subexprs(def);
        changed |= simplify_cfg(def);
        changed |= simplify_phis(def);
        changed |= remove_dead(def);
        trace!(function = %def.name, round, changed, "optimizer round");
        if !changed {
            break;
        }
    }
}

fn resolve(mut op: Operand, map: &Replacements) -> Operand {
    // Bounded so a replacement cycle cannot hang the optimizer.
    for _ in 0..=map.len() {
        match op {
            Operand::Inst(id) => match map.get(&id.0) {
                Some(&next) => op = next,
                None => break,
            },
            _ => break,
        }
    }
    op
}

fn replace_all(def: &mut FunctionDef, map: &Replacements) {
    if map.is_empty() {
        return;
    }
    for b in &def.blocks {
        for id in &b.insts {
            for op in def.insts[id.0].kind.operands_mut() {
                *op = resolve(*op, map);
            }
        }
    }
    for b in &mut def.blocks {
        match &mut b.term {
            Some(Terminator::CondBr { cond, .. }) => *cond = resolve(*cond, map),
            Some(Terminator::Ret(v)) => *v = resolve(*v, map),
            _ => {}
        }
    }
}

fn arith(op: ArithOp, l: f64, r: f64) -> f64 {
    match op {
        ArithOp::FAdd => l + r,
        ArithOp::FSub => l - r,
        ArithOp::FMul => l * r,
        ArithOp::FDiv => l / r,
        ArithOp::FRem => l % r,
    }
}

fn fold(kind: &InstKind) -> Option<Operand> {
    match kind {
        InstKind::Arith {
            op,
            lhs: Operand::Const(l),
            rhs: Operand::Const(r),
        } => Some(Operand::Const(arith(*op, *l, *r))),
        InstKind::Compare {
            pred,
            lhs: Operand::Const(l),
            rhs: Operand::Const(r),
        } => Some(Operand::Bool(compare(*pred, *l, *r))),
        InstKind::BoolToFloat(Operand::Bool(b)) => {
            Some(Operand::Const(if *b { 1.0 } else { 0.0 }))
        }
        _ => None,
    }
}

/// Peephole combine: evaluates instructions whose operands are all constant.
fn fold_constants(def: &mut FunctionDef) -> bool {
    let mut map = Replacements::new();
    let order: Vec<InstId> = def
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter().copied())
        .collect();
    for id in order {
        let kind = &mut def.insts[id.0].kind;
        for op in kind.operands_mut() {
            *op = resolve(*op, &map);
        }
        if let Some(v) = fold(kind) {
            map.insert(id.0, v);
        }
    }
    replace_all(def, &map);
    !map.is_empty()
}

#[derive(PartialEq, Eq, Hash)]
enum ExprKey {
    Arith(ArithOp, OperandKey, OperandKey),
    Compare(Predicate, OperandKey, OperandKey),
    BoolToFloat(OperandKey),
}

/// Block-local: a pure instruction equal to an earlier one in the same
/// block is replaced by it.
fn eliminate_common_subexprs(def: &mut FunctionDef) -> bool {
    let mut map = Replacements::new();
    for b in &def.blocks {
        let mut seen: HashMap<ExprKey, InstId> = HashMap::new();
        for id in &b.insts {
            let k = |op: &Operand| resolve(*op, &map).key();
            let key = match &def.insts[id.0].kind {
                InstKind::Arith { op, lhs, rhs } => ExprKey::Arith(*op, k(lhs), k(rhs)),
                InstKind::Compare { pred, lhs, rhs } => ExprKey::Compare(*pred, k(lhs), k(rhs)),
                InstKind::BoolToFloat(v) => ExprKey::BoolToFloat(k(v)),
                InstKind::Phi(_) | InstKind::Call { .. } => continue,
            };
            match seen.get(&key) {
                Some(first) => {
                    map.insert(id.0, Operand::Inst(*first));
                }
                None => {
                    seen.insert(key, *id);
                }
            }
        }
    }
    replace_all(def, &map);
    !map.is_empty()
}

/// Folds constant branches, drops unreachable blocks, and prunes phi edges
/// from blocks that are no longer predecessors.
fn simplify_cfg(def: &mut FunctionDef) -> bool {
    let mut changed = false;

    for b in &mut def.blocks {
        if let Some(Terminator::CondBr { cond, then, els }) = b.term {
            let target = match cond {
                Operand::Bool(true) => Some(then),
                Operand::Bool(false) => Some(els),
                _ if then == els => Some(then),
                _ => None,
            };
            if let Some(t) = target {
                b.term = Some(Terminator::Br(t));
                changed = true;
            }
        }
    }

    let mut reachable = vec![false; def.blocks.len()];
    let mut work = vec![0];
    while let Some(bi) = work.pop() {
        if bi >= reachable.len() || reachable[bi] {
            continue;
        }
        reachable[bi] = true;
        if let Some(term) = &def.blocks[bi].term {
            work.extend(term.successors());
        }
    }

    if reachable.iter().any(|r| !r) {
        let mut remap = vec![None; def.blocks.len()];
        let mut next = 0;
        for (i, r) in reachable.iter().enumerate() {
            if *r {
                remap[i] = Some(next);
                next += 1;
            }
        }

        let blocks = std::mem::take(&mut def.blocks);
        def.blocks = blocks
            .into_iter()
            .zip(&reachable)
            .filter(|(_, r)| **r)
            .map(|(b, _)| b)
            .collect();

        for b in &mut def.blocks {
            let fix = |t: usize| remap[t].unwrap_or(t);
            b.term = match b.term {
                Some(Terminator::Br(t)) => Some(Terminator::Br(fix(t))),
                Some(Terminator::CondBr { cond, then, els }) => Some(Terminator::CondBr {
                    cond,
                    then: fix(then),
                    els: fix(els),
                }),
                other => other,
            };
        }
        for b in &def.blocks {
            for id in &b.insts {
                if let InstKind::Phi(incoming) = &mut def.insts[id.0].kind {
                    *incoming = incoming
                        .iter()
                        .filter_map(|(v, p)| remap.get(*p).copied().flatten().map(|p| (*v, p)))
                        .collect();
                }
            }
        }
        changed = true;
    }

    let preds = def.predecessors();
    for (bi, b) in def.blocks.iter().enumerate() {
        for id in &b.insts {
            if let InstKind::Phi(incoming) = &mut def.insts[id.0].kind {
                let before = incoming.len();
                incoming.retain(|(_, p)| preds[bi].contains(p));
                changed |= incoming.len() != before;
            }
        }
    }

    changed
}

/// A phi whose inputs, ignoring itself, are all one value is that value.
fn simplify_phis(def: &mut FunctionDef) -> bool {
    let mut map = Replacements::new();
    for b in &def.blocks {
        for id in &b.insts {
            let incoming = match &def.insts[id.0].kind {
                InstKind::Phi(incoming) => incoming,
                _ => continue,
            };
            let this = Operand::Inst(*id).key();
            let mut unique: Option<Operand> = None;
            let mut trivial = true;
            for (v, _) in incoming {
                let v = resolve(*v, &map);
                if v.key() == this {
                    continue;
                }
                match unique {
                    None => unique = Some(v),
                    Some(u) if u.key() == v.key() => {}
                    Some(_) => {
                        trivial = false;
                        break;
                    }
                }
            }
            if let (true, Some(u)) = (trivial, unique) {
                map.insert(id.0, u);
            }
        }
    }
    replace_all(def, &map);
    !map.is_empty()
}

/// Drops pure instructions nobody uses.
fn remove_dead(def: &mut FunctionDef) -> bool {
    let mut changed = false;
    loop {
        let mut uses = vec![0usize; def.insts.len()];
        let mut count = |op: Operand| {
            if let Operand::Inst(id) = op {
                uses[id.0] += 1;
            }
        };
        for b in &def.blocks {
            for id in &b.insts {
                for op in def.insts[id.0].kind.operands() {
                    count(op);
                }
            }
            match b.term {
                Some(Terminator::CondBr { cond, .. }) => count(cond),
                Some(Terminator::Ret(v)) => count(v),
                _ => {}
            }
        }

        let insts = &def.insts;
        let mut removed = false;
        for b in &mut def.blocks {
            let before = b.insts.len();
            b.insts
                .retain(|id| uses[id.0] > 0 || !insts[id.0].kind.is_pure());
            removed |= b.insts.len() != before;
        }
        if !removed {
            return changed;
        }
        changed = true;
    }
}
