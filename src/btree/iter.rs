//! In-order traversal.
//!
//! A `Traversal` walks the tree depth-first with an explicit stack of
//! (node, cursor) frames, yielding pairs lazily in key order or reverse
//! key order. While one is alive the tree is flagged in-traversal and
//! refuses mutation; the flag drops with the iterator.

use crate::btree::node::Node;
use crate::btree::tree::BTreeIndex;
use crate::error::{Result, TreeError};

struct Frame<'t, K, V> {
    node: Node<'t, K, V>,
    /// Next slot to visit; counts up when ascending, down when descending
    cursor: usize,
    /// Whether the child at `cursor` has already been walked
    entered_child: bool,
}

enum Step<'t, K, V> {
    Descend(Node<'t, K, V>),
    Yield(K, V),
    Pop,
}

/// Lazy ordered iterator over a tree's pairs
pub struct Traversal<'t, K, V> {
    tree: &'t BTreeIndex<K, V>,
    stack: Vec<Frame<'t, K, V>>,
    ascending: bool,
    finished: bool,
}

impl<'t, K, V> Traversal<'t, K, V> {
    pub(crate) fn new(
        tree: &'t BTreeIndex<K, V>,
        root: Option<Node<'t, K, V>>,
        ascending: bool,
    ) -> Result<Self> {
        tree.begin_traversal();
        let mut traversal = Self {
            tree,
            stack: Vec::new(),
            ascending,
            finished: false,
        };
        if let Some(root) = root {
            traversal.push_frame(root)?;
        }
        Ok(traversal)
    }

    fn push_frame(&mut self, node: Node<'t, K, V>) -> Result<()> {
        let cursor = if self.ascending {
            0
        } else {
            node.pair_count()?
        };
        self.stack.push(Frame {
            node,
            cursor,
            entered_child: false,
        });
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<(K, V)>> {
        loop {
            let step = {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(None);
                };
                let leaf = top.node.is_leaf()?;

                if self.ascending {
                    if leaf {
                        if top.cursor < top.node.pair_count()? {
                            let i = top.cursor;
                            top.cursor += 1;
                            Step::Yield(top.node.get_key(i)?, top.node.get_value(i)?)
                        } else {
                            Step::Pop
                        }
                    } else if !top.entered_child {
                        top.entered_child = true;
                        let child = top.node.get_child(top.cursor)?.ok_or_else(|| {
                            TreeError::corruption(format!(
                                "internal node {} lacks child {}",
                                top.node.page_index(),
                                top.cursor
                            ))
                        })?;
                        Step::Descend(child)
                    } else if top.cursor < top.node.pair_count()? {
                        let i = top.cursor;
                        top.cursor += 1;
                        top.entered_child = false;
                        Step::Yield(top.node.get_key(i)?, top.node.get_value(i)?)
                    } else {
                        Step::Pop
                    }
                } else if leaf {
                    if top.cursor > 0 {
                        top.cursor -= 1;
                        Step::Yield(
                            top.node.get_key(top.cursor)?,
                            top.node.get_value(top.cursor)?,
                        )
                    } else {
                        Step::Pop
                    }
                } else if !top.entered_child {
                    top.entered_child = true;
                    let child = top.node.get_child(top.cursor)?.ok_or_else(|| {
                        TreeError::corruption(format!(
                            "internal node {} lacks child {}",
                            top.node.page_index(),
                            top.cursor
                        ))
                    })?;
                    Step::Descend(child)
                } else if top.cursor > 0 {
                    top.cursor -= 1;
                    top.entered_child = false;
                    Step::Yield(
                        top.node.get_key(top.cursor)?,
                        top.node.get_value(top.cursor)?,
                    )
                } else {
                    Step::Pop
                }
            };

            match step {
                Step::Descend(child) => self.push_frame(child)?,
                Step::Yield(key, value) => return Ok(Some((key, value))),
                Step::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}

impl<K, V> Iterator for Traversal<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl<K, V> Drop for Traversal<'_, K, V> {
    fn drop(&mut self) {
        self.tree.end_traversal();
    }
}
