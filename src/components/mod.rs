//! Ready-made components.
//!
//! - **IndepVarComp**: independent outputs that drive the rest of a model
//! - **LinearMap**: `y = A x + b` with its exact Jacobian
//! - **Paraboloid**: `f = (x - 3)^2 + x y + (y + 4)^2 - 3`
//! - **QuadraticState**: implicit state solving `a x^2 + b x + c = 0`
//! - **DualComp** (feature `autodiff`): scalar function whose partials come
//!   from dual numbers
//!
//! ## Example
//!
//! ```
//! use plexus::components::{IndepVarComp, QuadraticState};
//! use plexus::{Group, Problem};
//!
//! let mut root = Group::new();
//! root.add("coeffs", IndepVarComp::new("a", 1.0).add("b", -3.0).add("c", 2.0), &["*"]);
//! root.add("quad", QuadraticState::new(3.0), &["*"]);
//!
//! let mut problem = Problem::new(root);
//! problem.setup().unwrap();
//! problem.run().unwrap();
//! assert!((problem.get_scalar("x").unwrap() - 2.0).abs() < 1e-10);
//! ```

#[cfg(feature = "autodiff")]
pub mod dual;
pub mod implicit;
pub mod indep;
pub mod linear;
pub mod paraboloid;

#[cfg(feature = "autodiff")]
pub use dual::DualComp;
pub use implicit::QuadraticState;
pub use indep::IndepVarComp;
pub use linear::LinearMap;
pub use paraboloid::Paraboloid;
