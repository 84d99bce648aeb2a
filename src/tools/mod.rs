//! Small reusable components for the descriptor routines.

pub mod bits;
