/*!
 * Side-channel hygiene for key material
 */

pub mod constant_time;

pub use constant_time::buffers_equal;
pub use constant_time::bytes_equal;
