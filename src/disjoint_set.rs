/// Union-find over the fixed universe `0..n`.
///
/// Used for the cycle tests of the spanning-tree construction and for the
/// contractions of the randomized min-cut.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    father: Vec<usize>,
    set_count: usize,
}

impl DisjointSet {
    /// Create `n` singleton sets.
    pub fn new(n: usize) -> Self {
        Self {
            father: (0..n).collect(),
            set_count: n,
        }
    }

    /// Size of the universe.
    pub fn len(&self) -> usize {
        self.father.len()
    }

    pub fn is_empty(&self) -> bool {
        self.father.is_empty()
    }

    /// Number of disjoint sets left.
    pub fn set_count(&self) -> usize {
        self.set_count
    }

    /// The representative of the set containing `x`.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.father[root] != root {
            root = self.father[root];
        }

        // Path compression: point every vertex on the way directly at the root.
        let mut current = x;
        while self.father[current] != root {
            let next = self.father[current];
            self.father[current] = root;
            current = next;
        }

        root
    }

    /// Merge the sets containing `x` and `y`. Returns false when they already
    /// were the same set, in which case nothing changes.
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return false;
        }

        self.father[root_y] = root_x;
        self.set_count -= 1;
        true
    }
}
