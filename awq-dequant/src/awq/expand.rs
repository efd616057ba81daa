/// Broadcast of a `groups x cols` matrix to `groups*group_size x cols`, without copying.
///
/// Row `r` of the expanded matrix is row `r / group_size` of the source.
#[derive(Debug, Clone, Copy)]
pub struct GroupedRows<'a, T> {
    data: &'a [T],
    cols: usize,
    group_size: usize,
}

impl<'a, T> GroupedRows<'a, T> {
    pub fn new(data: &'a [T], cols: usize, group_size: usize) -> Self {
        debug_assert!(group_size > 0);
        debug_assert!(cols == 0 || data.len() % cols == 0);
        Self {
            data,
            cols,
            group_size,
        }
    }

    pub fn group_of(&self, row: usize) -> usize {
        row / self.group_size
    }

    pub fn expanded_rows(&self) -> usize {
        if self.cols == 0 {
            return 0;
        }
        (self.data.len() / self.cols) * self.group_size
    }

    /// Row `row` of the expanded matrix.
    pub fn row(&self, row: usize) -> &'a [T] {
        let start = self.group_of(row) * self.cols;
        &self.data[start..start + self.cols]
    }
}

/// Materialize the expansion: `dst` receives `groups*group_size` rows of `cols` values.
pub fn expand_groups_into<T: Copy>(dst: &mut [T], src: &[T], cols: usize, group_size: usize) {
    let view = GroupedRows::new(src, cols, group_size);
    debug_assert_eq!(dst.len(), view.expanded_rows() * cols);
    if cols == 0 {
        return;
    }
    for (r, dst_row) in dst.chunks_exact_mut(cols).enumerate() {
        dst_row.copy_from_slice(view.row(r));
    }
}

/// Materialize the expansion into a new buffer.
pub fn expand_groups<T: Copy + Default>(src: &[T], cols: usize, group_size: usize) -> Vec<T> {
    let rows = GroupedRows::new(src, cols, group_size).expanded_rows();
    let mut out = vec![T::default(); rows * cols];
    expand_groups_into(&mut out, src, cols, group_size);
    out
}
