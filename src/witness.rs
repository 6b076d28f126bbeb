// SPDX-License-Identifier: CC0-1.0

//! The segregated witness stack of a transaction input.

use std::fmt;
use std::ops::Index;

use hex::DisplayHex;

use crate::consensus::compact_size_len;

/// The witness stack: zero or more byte-string stack elements.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Witness {
    stack: Vec<Vec<u8>>,
}

impl Witness {
    /// Constructs an empty witness.
    pub fn new() -> Self { Witness::default() }

    /// Constructs a witness from a slice of stack elements.
    pub fn from_slice<T: AsRef<[u8]>>(elements: &[T]) -> Self {
        Witness { stack: elements.iter().map(|e| e.as_ref().to_vec()).collect() }
    }

    /// Pushes an element onto the top of the stack.
    pub fn push<T: AsRef<[u8]>>(&mut self, element: T) {
        self.stack.push(element.as_ref().to_vec());
    }

    /// Number of stack elements.
    pub fn len(&self) -> usize { self.stack.len() }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool { self.stack.is_empty() }

    /// Returns the last (topmost) element.
    pub fn last(&self) -> Option<&[u8]> { self.stack.last().map(|e| &e[..]) }

    /// Iterates the stack bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.stack.iter().map(|e| &e[..])
    }

    /// Serialized size of this witness within a segwit transaction.
    pub fn serialized_size(&self) -> usize {
        compact_size_len(self.stack.len() as u64)
            + self
                .stack
                .iter()
                .map(|e| compact_size_len(e.len() as u64) + e.len())
                .sum::<usize>()
    }
}

impl Index<usize> for Witness {
    type Output = [u8];
    fn index(&self, index: usize) -> &[u8] { &self.stack[index] }
}

impl From<Vec<Vec<u8>>> for Witness {
    fn from(stack: Vec<Vec<u8>>) -> Self { Witness { stack } }
}

impl fmt::Debug for Witness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.stack.iter().map(|e| e.to_lower_hex_string())).finish()
    }
}
