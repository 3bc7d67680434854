/*!
# aoloop

A real-time adaptive-optics control framework: Shack-Hartmann wavefront
sensing, wavefront reconstruction, wavefront-corrector actuation and a
multi-client TCP control session, run as a single long-lived daemon.

## Layout

 - [`frame`] / [`ring`]: camera frames and the bounded ring buffer
   shared between the capture thread and every consumer.
 - [`shift`]: the fork/join worker pool that measures subimage shifts.
 - [`wfs`]: the Shack-Hartmann device — microlens geometry, basis
   transforms, SVD reconstruction, measurement.
 - [`device`]: the camera, wavefront-corrector and telescope devices,
   plus the process-wide [`device::Registry`].
 - [`sim`]: the optical simulator used in place of real hardware
   (seeing, WFC error/correction surfaces, MLA imaging, CCD noise).
 - [`loop_engine`]: the `LISTEN`/`OPEN`/`CLOSED`/`CAL` state machine
   that drives a capture-measure-reconstruct-actuate cycle.
 - [`session`]: the line-oriented TCP control protocol.
 - [`config`]: the plain-text configuration file format.
 - [`fits`]: a minimal FITS-like image writer for `grab`/`dark`/`flat`.
 - [`error`]: the crate-wide [`error::AoError`] taxonomy.

## Concurrency model

Every component is driven by OS threads communicating through
`std::sync::{Mutex, Condvar}` and `crossbeam_channel`, not async tasks:
one thread per camera capture loop, one thread pool for the shift
engine, one thread for the loop engine, and one thread per accepted
TCP connection.
*/

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod fits;
pub mod frame;
pub mod loop_engine;
pub mod ring;
pub mod session;
pub mod shift;
pub mod sim;
pub mod wfs;

pub use error::{AoError, AoResult};
