use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

/// Transitive remix-chain state over transaction ids.
///
/// Implemented as an integer arena with union-by-rank and path
/// compression; nodes address each other by index, never by reference,
/// so the structure is serializable and free of ownership cycles.
/// Membership can only grow within a run. Merges are commutative and
/// associative: workers may submit them in any arrival order.
#[derive(Debug, Default)]
pub struct MixChainSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
    txids: Vec<String>,
    index: HashMap<String, usize>,
}

impl MixChainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a txid, returning its node index.
    pub fn intern(&mut self, txid: &str) -> usize {
        if let Some(&node) = self.index.get(txid) {
            return node;
        }
        let node = self.parent.len();
        self.parent.push(node);
        self.rank.push(0);
        self.txids.push(txid.to_string());
        self.index.insert(txid.to_string(), node);
        node
    }

    /// Records remix evidence linking two transactions, merging their
    /// chains if they were separate.
    pub fn link(&mut self, a: &str, b: &str) {
        let a = self.intern(a);
        let b = self.intern(b);
        self.union(a, b);
    }

    /// Whether two transactions ended up in the same chain.
    pub fn same_chain(&mut self, a: &str, b: &str) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(a), Some(b)) => self.find(a) == self.find(b),
            _ => false,
        }
    }

    /// All transactions in the chain containing `txid`, sorted.
    pub fn chain_of(&mut self, txid: &str) -> Vec<String> {
        let Some(&node) = self.index.get(txid) else {
            return Vec::new();
        };
        let root = self.find(node);
        let mut members = Vec::new();
        for n in 0..self.parent.len() {
            if self.find(n) == root {
                members.push(self.txids[n].clone());
            }
        }
        members.sort();
        members
    }

    /// Snapshot of every chain with more than one member, ordered by the
    /// smallest txid in each chain so the output does not depend on the
    /// order the merges arrived in.
    pub fn chains(&mut self) -> Vec<MixChain> {
        let mut by_root: HashMap<usize, Vec<String>> = HashMap::new();
        for node in 0..self.parent.len() {
            let root = self.find(node);
            by_root.entry(root).or_default().push(self.txids[node].clone());
        }
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for mut members in by_root.into_values() {
            if members.len() < 2 {
                continue;
            }
            members.sort();
            groups.insert(members[0].clone(), members);
        }
        groups
            .into_values()
            .map(|members| MixChain { members })
            .collect()
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression.
        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One transitive grouping of mixes linked by remix evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MixChain {
    pub members: Vec<String>,
}
