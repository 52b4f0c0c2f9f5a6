use std::collections::{BTreeMap, HashMap};

use pc_types::ScalarValue;

use crate::Strands;

/// One distinct path prefix of a strand batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestNode {
    pub depth: usize,
    pub parent: Option<usize>,
    pub value: ScalarValue,
    /// Sort value of the last non-removing strand through this prefix.
    pub sort_value: ScalarValue,
    pub net_count: i64,
    pub strand_rows: Vec<usize>,
    pub children: Vec<usize>,
    /// Net contribution per primary key; only filled at leaf depth.
    pub pkeys: BTreeMap<ScalarValue, i64>,
}

impl DigestNode {
    fn new(depth: usize, parent: Option<usize>, value: ScalarValue) -> Self {
        Self {
            depth,
            parent,
            value,
            sort_value: ScalarValue::none(),
            net_count: 0,
            strand_rows: Vec::new(),
            children: Vec::new(),
            pkeys: BTreeMap::new(),
        }
    }
}

/// Strand rows grouped into a prefix tree rooted at index 0.
#[derive(Debug, Clone, PartialEq)]
pub struct StrandDigest {
    depth: usize,
    nodes: Vec<DigestNode>,
}

impl StrandDigest {
    #[must_use]
    pub fn build(strands: &Strands) -> Self {
        let depth = strands.depth();
        let mut nodes = vec![DigestNode::new(0, None, ScalarValue::none())];
        let mut index: HashMap<(usize, ScalarValue), usize> = HashMap::new();

        for row in 0..strands.len() {
            let count = strands.count(row);
            let pkey = strands.pkey(row);
            let mut current = 0;
            nodes[0].net_count += count;
            nodes[0].strand_rows.push(row);
            for level in 1..=depth {
                let value = strands.pivot_value(row, level);
                let child = match index.get(&(current, value.clone())) {
                    Some(child) => *child,
                    None => {
                        let child = nodes.len();
                        nodes.push(DigestNode::new(level, Some(current), value.clone()));
                        nodes[current].children.push(child);
                        index.insert((current, value), child);
                        child
                    }
                };
                let node = &mut nodes[child];
                node.net_count += count;
                node.strand_rows.push(row);
                if count >= 0 {
                    node.sort_value = strands.sort_value(row, level);
                }
                current = child;
            }
            let leaf = &mut nodes[current];
            let entry = leaf.pkeys.entry(pkey).or_insert(0);
            *entry += count;
        }

        for node in &mut nodes {
            node.pkeys.retain(|_, net| *net != 0);
        }
        Self { depth, nodes }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn root(&self) -> &DigestNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&DigestNode> {
        self.nodes.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no strand went into the digest.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes[0].strand_rows.is_empty()
    }

    /// Pre-order node indices, parents before children, siblings in order
    /// of first appearance.
    #[must_use]
    pub fn dfs(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            stack.extend(self.nodes[idx].children.iter().rev().copied());
        }
        out
    }

    /// Pivot values from the first level down to `idx`.
    #[must_use]
    pub fn path(&self, idx: usize) -> Vec<ScalarValue> {
        let mut out = Vec::new();
        let mut current = Some(idx);
        while let Some(node) = current.and_then(|i| self.nodes.get(i)) {
            if node.parent.is_some() {
                out.push(node.value.clone());
            }
            current = node.parent;
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use pc_types::ScalarValue;

    use super::StrandDigest;
    use crate::tests::strands_of;

    #[test]
    fn groups_strands_by_prefix() {
        let strands = strands_of(&[
            (1, ["US", "NY"], 1),
            (2, ["US", "CA"], 1),
            (3, ["EU", "FR"], 1),
            (1, ["US", "NY"], -1),
            (1, ["EU", "DE"], 1),
        ]);
        let digest = StrandDigest::build(&strands);
        assert_eq!(digest.depth(), 2);
        assert_eq!(digest.root().net_count, 3);
        assert_eq!(digest.root().children.len(), 2);

        let order = digest.dfs();
        assert_eq!(order[0], 0);
        let paths: Vec<Vec<ScalarValue>> = order.iter().map(|idx| digest.path(*idx)).collect();
        assert_eq!(paths[1], vec![ScalarValue::string("US")]);
        assert_eq!(paths[2], vec![ScalarValue::string("US"), ScalarValue::string("NY")]);

        let ny = digest.get(order[2]).expect("ny");
        assert_eq!(ny.net_count, 0);
        assert!(ny.pkeys.is_empty());
        assert_eq!(ny.strand_rows, vec![0, 3]);

        let de = order
            .iter()
            .filter_map(|idx| digest.get(*idx))
            .find(|node| node.value == ScalarValue::string("DE"))
            .expect("de");
        assert_eq!(de.pkeys.get(&ScalarValue::int64(1)), Some(&1));
    }
}
