//! 以竞技场下标寻址的AVL树。
//!
//! 节点存放在Vec里，由句柄引用；持有者负责在删除后不再使用旧句柄。
//! 平衡因子约定：balance = 右子树高 - 左子树高。

use std::cmp::Ordering;

const NIL: usize = usize::MAX;

/// 树节点句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(usize);

struct Node<K> {
    key: Option<K>,
    value: usize,
    parent: usize,
    left: usize,
    right: usize,
    balance: i8,
}

pub struct AvlArena<K> {
    nodes: Vec<Node<K>>,
    root: usize,
    free: Vec<usize>,
    len: usize,
}

impl<K: Ord> AvlArena<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NIL,
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self, r: NodeRef) -> &K {
        self.nodes[r.0].key.as_ref().expect("句柄已失效")
    }

    pub fn value(&self, r: NodeRef) -> usize {
        self.nodes[r.0].value
    }

    fn alloc(&mut self, key: K, value: usize) -> usize {
        let node = Node {
            key: Some(key),
            value,
            parent: NIL,
            left: NIL,
            right: NIL,
            balance: 0,
        };
        self.len += 1;
        if let Some(i) = self.free.pop() {
            self.nodes[i] = node;
            i
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, i: usize) {
        self.nodes[i].key = None;
        self.nodes[i].parent = NIL;
        self.nodes[i].left = NIL;
        self.nodes[i].right = NIL;
        self.free.push(i);
        self.len -= 1;
    }

    fn cmp_key(&self, key: &K, node: usize) -> Ordering {
        key.cmp(self.nodes[node].key.as_ref().expect("比较到空槽"))
    }

    /// 插入一个键值，返回句柄。相等键允许共存（排在右侧）。
    pub fn insert(&mut self, key: K, value: usize) -> NodeRef {
        let n = self.alloc(key, value);
        if self.root == NIL {
            self.root = n;
            return NodeRef(n);
        }
        let mut cur = self.root;
        loop {
            let left_side = self
                .nodes[n]
                .key
                .as_ref()
                .expect("新节点键为空")
                .cmp(self.nodes[cur].key.as_ref().expect("比较到空槽"))
                == Ordering::Less;
            if left_side {
                if self.nodes[cur].left != NIL {
                    cur = self.nodes[cur].left;
                } else {
                    self.nodes[cur].left = n;
                    self.nodes[n].parent = cur;
                    break;
                }
            } else if self.nodes[cur].right != NIL {
                cur = self.nodes[cur].right;
            } else {
                self.nodes[cur].right = n;
                self.nodes[n].parent = cur;
                break;
            }
        }
        self.rebalance_after_insert(n);
        NodeRef(n)
    }

    pub fn remove(&mut self, r: NodeRef) {
        let n = r.0;
        if self.nodes[n].left != NIL && self.nodes[n].right != NIL {
            let succ = self
                .successor_index(n)
                .expect("有右子树的节点必有后继");
            self.swap_with_successor(n, succ);
        }
        let parent = self.nodes[n].parent;
        let child = if self.nodes[n].left != NIL {
            self.nodes[n].left
        } else {
            self.nodes[n].right
        };
        if child != NIL {
            self.nodes[child].parent = parent;
        }
        if parent == NIL {
            self.root = child;
        } else {
            if self.nodes[parent].left == n {
                self.nodes[parent].left = child;
                self.nodes[parent].balance += 1;
            } else {
                self.nodes[parent].right = child;
                self.nodes[parent].balance -= 1;
            }
            self.rebalance_after_delete(parent);
        }
        self.release(n);
    }

    pub fn leftmost(&self) -> Option<NodeRef> {
        if self.root == NIL {
            return None;
        }
        let mut cur = self.root;
        while self.nodes[cur].left != NIL {
            cur = self.nodes[cur].left;
        }
        Some(NodeRef(cur))
    }

    pub fn successor(&self, r: NodeRef) -> Option<NodeRef> {
        self.successor_index(r.0).map(NodeRef)
    }

    fn successor_index(&self, n: usize) -> Option<usize> {
        if self.nodes[n].right != NIL {
            let mut cur = self.nodes[n].right;
            while self.nodes[cur].left != NIL {
                cur = self.nodes[cur].left;
            }
            Some(cur)
        } else {
            let mut cur = n;
            while self.nodes[cur].parent != NIL && self.nodes[self.nodes[cur].parent].right == cur {
                cur = self.nodes[cur].parent;
            }
            let p = self.nodes[cur].parent;
            (p != NIL).then_some(p)
        }
    }

    /// 精确查找。
    pub fn find(&self, key: &K) -> Option<NodeRef> {
        let mut cur = self.root;
        while cur != NIL {
            match self.cmp_key(key, cur) {
                Ordering::Equal => return Some(NodeRef(cur)),
                Ordering::Less => cur = self.nodes[cur].left,
                Ordering::Greater => cur = self.nodes[cur].right,
            }
        }
        None
    }

    /// 最左侧键 >= key 的节点。
    pub fn lower_bound(&self, key: &K) -> Option<NodeRef> {
        let mut result = None;
        let mut cur = self.root;
        while cur != NIL {
            if self.cmp_key(key, cur) != Ordering::Greater {
                result = Some(NodeRef(cur));
                cur = self.nodes[cur].left;
            } else {
                cur = self.nodes[cur].right;
            }
        }
        result
    }

    fn rebalance_after_insert(&mut self, mut node: usize) {
        let mut parent = self.nodes[node].parent;
        while parent != NIL {
            if self.nodes[parent].left == node {
                self.nodes[parent].balance -= 1;
                match self.nodes[parent].balance {
                    0 => return,
                    -1 => {
                        node = parent;
                        parent = self.nodes[node].parent;
                    }
                    _ => {
                        if self.nodes[node].balance == -1 {
                            self.rotate_right(parent);
                            self.nodes[node].balance = 0;
                            self.nodes[parent].balance = 0;
                        } else {
                            let old_right = self.nodes[node].right;
                            self.rotate_left(node);
                            self.rotate_right(parent);
                            let b = self.nodes[old_right].balance;
                            self.nodes[node].balance = if b <= 0 { 0 } else { -1 };
                            self.nodes[parent].balance = if b == -1 { 1 } else { 0 };
                            self.nodes[old_right].balance = 0;
                        }
                        return;
                    }
                }
            } else {
                self.nodes[parent].balance += 1;
                match self.nodes[parent].balance {
                    0 => return,
                    1 => {
                        node = parent;
                        parent = self.nodes[node].parent;
                    }
                    _ => {
                        if self.nodes[node].balance == 1 {
                            self.rotate_left(parent);
                            self.nodes[node].balance = 0;
                            self.nodes[parent].balance = 0;
                        } else {
                            let old_left = self.nodes[node].left;
                            self.rotate_right(node);
                            self.rotate_left(parent);
                            let b = self.nodes[old_left].balance;
                            self.nodes[node].balance = if b >= 0 { 0 } else { 1 };
                            self.nodes[parent].balance = if b == 1 { -1 } else { 0 };
                            self.nodes[old_left].balance = 0;
                        }
                        return;
                    }
                }
            }
        }
    }

    fn rebalance_after_delete(&mut self, mut node: usize) {
        loop {
            let b = self.nodes[node].balance;
            if b == 1 || b == -1 {
                return;
            }
            if b == 0 {
                let parent = self.nodes[node].parent;
                if parent == NIL {
                    return;
                }
                if self.nodes[parent].left == node {
                    self.nodes[parent].balance += 1;
                } else {
                    self.nodes[parent].balance -= 1;
                }
                node = parent;
            } else if b == 2 {
                let old_right = self.nodes[node].right;
                let rb = self.nodes[old_right].balance;
                if rb >= 0 {
                    self.rotate_left(node);
                    self.nodes[node].balance = 1 - rb;
                    self.nodes[old_right].balance = rb - 1;
                    node = old_right;
                } else {
                    let old_right_left = self.nodes[old_right].left;
                    self.rotate_right(old_right);
                    self.rotate_left(node);
                    let b2 = self.nodes[old_right_left].balance;
                    self.nodes[node].balance = if b2 <= 0 { 0 } else { -1 };
                    self.nodes[old_right].balance = if b2 >= 0 { 0 } else { 1 };
                    self.nodes[old_right_left].balance = 0;
                    node = old_right_left;
                }
            } else {
                let old_left = self.nodes[node].left;
                let lb = self.nodes[old_left].balance;
                if lb <= 0 {
                    self.rotate_right(node);
                    self.nodes[node].balance = -1 - lb;
                    self.nodes[old_left].balance = lb + 1;
                    node = old_left;
                } else {
                    let old_left_right = self.nodes[old_left].right;
                    self.rotate_left(old_left);
                    self.rotate_right(node);
                    let b2 = self.nodes[old_left_right].balance;
                    self.nodes[node].balance = if b2 >= 0 { 0 } else { 1 };
                    self.nodes[old_left].balance = if b2 <= 0 { 0 } else { -1 };
                    self.nodes[old_left_right].balance = 0;
                    node = old_left_right;
                }
            }
        }
    }

    fn rotate_left(&mut self, node: usize) {
        let old_right = self.nodes[node].right;
        let old_right_left = self.nodes[old_right].left;
        let parent = self.nodes[node].parent;
        if parent != NIL {
            if self.nodes[parent].left == node {
                self.nodes[parent].left = old_right;
            } else {
                self.nodes[parent].right = old_right;
            }
        } else {
            self.root = old_right;
        }
        self.nodes[old_right].parent = parent;
        self.nodes[node].parent = old_right;
        self.nodes[node].right = old_right_left;
        if old_right_left != NIL {
            self.nodes[old_right_left].parent = node;
        }
        self.nodes[old_right].left = node;
    }

    fn rotate_right(&mut self, node: usize) {
        let old_left = self.nodes[node].left;
        let old_left_right = self.nodes[old_left].right;
        let parent = self.nodes[node].parent;
        if parent != NIL {
            if self.nodes[parent].left == node {
                self.nodes[parent].left = old_left;
            } else {
                self.nodes[parent].right = old_left;
            }
        } else {
            self.root = old_left;
        }
        self.nodes[old_left].parent = parent;
        self.nodes[node].parent = old_left;
        self.nodes[node].left = old_left_right;
        if old_left_right != NIL {
            self.nodes[old_left_right].parent = node;
        }
        self.nodes[old_left].right = node;
    }

    /// 让待删节点与其后继互换树中位置，保持其余节点不动。
    fn swap_with_successor(&mut self, n: usize, s: usize) {
        let nb = self.nodes[n].balance;
        self.nodes[n].balance = self.nodes[s].balance;
        self.nodes[s].balance = nb;

        let old_parent = self.nodes[n].parent;
        let old_left = self.nodes[n].left;
        let old_right = self.nodes[n].right;
        let s_parent = self.nodes[s].parent;
        let s_left = self.nodes[s].left;
        let s_right = self.nodes[s].right;

        if old_parent != NIL {
            if self.nodes[old_parent].left == n {
                self.nodes[old_parent].left = s;
            } else {
                self.nodes[old_parent].right = s;
            }
        } else {
            self.root = s;
        }
        self.nodes[s].parent = old_parent;

        if s_parent != n {
            if self.nodes[s_parent].left == s {
                self.nodes[s_parent].left = n;
            } else {
                self.nodes[s_parent].right = n;
            }
            self.nodes[s].right = old_right;
            self.nodes[n].parent = s_parent;
            if old_right != NIL {
                self.nodes[old_right].parent = s;
            }
        } else {
            self.nodes[s].right = n;
            self.nodes[n].parent = s;
        }

        self.nodes[n].left = s_left;
        if s_left != NIL {
            self.nodes[s_left].parent = n;
        }
        self.nodes[n].right = s_right;
        if s_right != NIL {
            self.nodes[s_right].parent = n;
        }
        self.nodes[s].left = old_left;
        if old_left != NIL {
            self.nodes[old_left].parent = s;
        }
    }
}

impl<K: Ord> Default for AvlArena<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeMap;

    fn collect_in_order(tree: &AvlArena<i64>) -> Vec<i64> {
        let mut out = Vec::new();
        let mut cur = tree.leftmost();
        while let Some(r) = cur {
            out.push(*tree.key(r));
            cur = tree.successor(r);
        }
        out
    }

    #[test]
    fn test_insert_ordered_iteration() {
        let mut tree = AvlArena::new();
        for k in [5i64, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            tree.insert(k, k as usize);
        }
        assert_eq!(collect_in_order(&tree), (0..10).collect::<Vec<_>>());
        assert_eq!(tree.len(), 10);
    }

    #[test]
    fn test_find_and_lower_bound() {
        let mut tree = AvlArena::new();
        for k in [10i64, 20, 30, 40] {
            tree.insert(k, 0);
        }
        assert_eq!(*tree.key(tree.find(&20).expect("应能找到")), 20);
        assert!(tree.find(&25).is_none());
        assert_eq!(*tree.key(tree.lower_bound(&25).expect("应有下界")), 30);
        assert_eq!(*tree.key(tree.lower_bound(&10).expect("应有下界")), 10);
        assert!(tree.lower_bound(&41).is_none());
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut tree = AvlArena::new();
        let mut refs = BTreeMap::new();
        for k in 0i64..64 {
            refs.insert(k, tree.insert(k, 0));
        }
        for k in (0i64..64).step_by(2) {
            tree.remove(refs.remove(&k).expect("句柄存在"));
        }
        assert_eq!(
            collect_in_order(&tree),
            (0i64..64).filter(|k| k % 2 == 1).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_random_against_btreemap() {
        let mut rng = rand::rng();
        let mut tree = AvlArena::new();
        let mut model: BTreeMap<i64, NodeRef> = BTreeMap::new();
        for _ in 0..2000 {
            let k: i64 = rng.random_range(0..500);
            if let Some(r) = model.remove(&k) {
                tree.remove(r);
            } else {
                model.insert(k, tree.insert(k, 0));
            }
            assert_eq!(tree.len(), model.len());
        }
        assert_eq!(
            collect_in_order(&tree),
            model.keys().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut tree = AvlArena::new();
        let a = tree.insert(1i64, 11);
        tree.remove(a);
        let b = tree.insert(2i64, 22);
        assert_eq!(*tree.key(b), 2);
        assert_eq!(tree.value(b), 22);
        assert_eq!(tree.len(), 1);
    }
}
