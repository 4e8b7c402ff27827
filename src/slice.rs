// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// An immutable byte slice that can be cloned without additional heap allocation
pub type Slice = byteview::ByteView;

/// Concatenates fragments into one value.
pub fn concat_slices<'a, I: IntoIterator<Item = &'a Slice>>(fragments: I) -> Slice {
    let mut out = vec![];
    for fragment in fragments {
        out.extend_from_slice(fragment);
    }
    Slice::from(out)
}
