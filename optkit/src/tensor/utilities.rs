//! Module containing utility functions when dealing with tensors

/// Row-major strides of `shape`
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Given a tensor shape this function returns all of its coordinates, in row-major order
pub(crate) fn get_all_coords(shape: &[usize]) -> Vec<Vec<usize>> {
    if shape.is_empty() {
        return vec![vec![]];
    }
    let size = shape.iter().product::<usize>();
    // If size is zero we just return an empty vector
    if size == 0 {
        return vec![];
    }

    let mut output: Vec<Vec<usize>> = (0..shape[0]).map(|i| vec![i]).collect::<Vec<Vec<usize>>>();

    for &dim in &shape[1..] {
        output = output
            .into_iter()
            .flat_map(|coords| {
                (0..dim).map(move |i| {
                    let mut round_vec = coords.clone();
                    round_vec.push(i);
                    round_vec
                })
            })
            .collect::<Vec<Vec<usize>>>();
    }

    output
}

/// Returns true when `axes` contains each of `0..axes.len()` exactly once
pub(crate) fn is_permutation(axes: &[usize]) -> bool {
    let mut seen = vec![false; axes.len()];
    axes.iter().all(|&a| {
        if a >= seen.len() || seen[a] {
            return false;
        }
        seen[a] = true;
        true
    })
}

/// The permutation undoing `axes`: `permute(permute(t, axes), inverse_permutation(axes)) == t`
pub fn inverse_permutation(axes: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; axes.len()];
    for (i, &a) in axes.iter().enumerate() {
        inverse[a] = i;
    }
    inverse
}
