//! Control-flow materialization plan
//!
//! Decides which source blocks are lowered and in which order. A block is
//! live when it is reachable from the entry through branches, fallthrough, or
//! an exceptional edge from a try block that contains a raising instruction.
//!
//! Emission order is reverse postorder over live blocks, with every block
//! outside handler bodies (including try blocks) emitted before any handler
//! body. Try blocks stay in the first group so their definitions are placed
//! before the handlers that read them.
//!
//! The plan also carries the dominator tree of the live graph, which decides
//! whether a register's definition reaches a use.

use crate::ir::{exceptional_successors, BlockId, Method, Region};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    /// Live blocks in emission order
    pub order: Vec<BlockId>,
    /// Unreachable blocks; only their phis are retired
    pub retired: Vec<BlockId>,
    pub dominators: Dominators,
    live: Vec<bool>,
}

impl BlockPlan {
    pub fn is_live(&self, id: BlockId) -> bool {
        self.live.get(id.index()).copied().unwrap_or(false)
    }
}

/// Successors of a block including its exceptional edges
pub fn successors(method: &Method, id: BlockId) -> Vec<BlockId> {
    let Some(block) = method.block(id) else {
        return Vec::new();
    };
    let mut succs = block.successors(method.next_block(id));
    for handler in exceptional_successors(block, &method.clauses) {
        if !succs.contains(&handler) {
            succs.push(handler);
        }
    }
    succs.retain(|s| s.index() < method.blocks.len());
    succs
}

/// Immediate dominators of the live blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dominators {
    /// The entry is its own immediate dominator; dead blocks have none
    idom: Vec<Option<BlockId>>,
}

impl Dominators {
    /// Iterative data-flow over reverse postorder (Cooper, Harvey, Kennedy)
    pub fn compute(method: &Method, rpo: &[BlockId]) -> Self {
        let count = method.blocks.len();
        let mut number = vec![usize::MAX; count];
        for (index, id) in rpo.iter().enumerate() {
            number[id.index()] = index;
        }
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); count];
        for id in rpo {
            for succ in successors(method, *id) {
                preds[succ.index()].push(*id);
            }
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; count];
        let Some(entry) = rpo.first() else {
            return Self { idom };
        };
        idom[entry.index()] = Some(*entry);

        let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| {
            while a != b {
                while number[a.index()] > number[b.index()] {
                    a = idom[a.index()].unwrap_or(*entry);
                }
                while number[b.index()] > number[a.index()] {
                    b = idom[b.index()].unwrap_or(*entry);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for id in &rpo[1..] {
                let mut new_idom: Option<BlockId> = None;
                for pred in &preds[id.index()] {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => *pred,
                        Some(current) => intersect(&idom, *pred, current),
                    });
                }
                if new_idom.is_some() && idom[id.index()] != new_idom {
                    idom[id.index()] = new_idom;
                    changed = true;
                }
            }
        }
        Self { idom }
    }

    pub fn idom(&self, id: BlockId) -> Option<BlockId> {
        self.idom.get(id.index()).copied().flatten()
    }

    /// Every path from the entry to `b` passes through `a`
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if self.idom(b).is_none() {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(up) if up != current => current = up,
                _ => return false,
            }
        }
    }
}

/// Compute liveness and emission order
pub fn plan(method: &Method) -> BlockPlan {
    let count = method.blocks.len();
    let mut live = vec![false; count];
    let mut postorder = Vec::with_capacity(count);

    if count > 0 {
        // Iterative DFS; each frame holds the block and its unvisited successors
        let mut stack: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        live[0] = true;
        let entry = BlockId(0);
        let mut succs = successors(method, entry);
        succs.reverse();
        stack.push((entry, succs));

        while let Some((id, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) if !live[next.index()] => {
                    live[next.index()] = true;
                    let mut succs = successors(method, next);
                    succs.reverse();
                    stack.push((next, succs));
                }
                Some(_) => {}
                None => {
                    postorder.push(*id);
                    stack.pop();
                }
            }
        }
    }

    postorder.reverse();
    let dominators = Dominators::compute(method, &postorder);
    let in_handler = |id: &BlockId| {
        matches!(
            method.block(*id).map(|b| b.region),
            Some(Region::Handler(_))
        )
    };
    let mut order: Vec<BlockId> = postorder.iter().copied().filter(|id| !in_handler(id)).collect();
    order.extend(postorder.iter().copied().filter(|id| in_handler(id)));

    let retired = (0..count as u32)
        .map(BlockId)
        .filter(|id| !live[id.index()])
        .collect();

    BlockPlan {
        order,
        retired,
        dominators,
        live,
    }
}
