// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The native-backend seam.

Exactly one backend is compiled in. The noop backend is an in-process
implementation of the device contract (allocate buffers, record command
buffers, submit with a completion callback) that the test suite runs against;
the wgpu backend maps the same surface onto a live `wgpu` device supplied by
the host.

Both backends export the same duck-typed set of names: `Device`, `Buffer`,
`BufferOptions`, `TextureView`, `CommandBuffer`, `RenderTargets`, `Error`,
`CompletionHandler`.
*/

#[cfg(not(feature = "backend_wgpu"))]
mod noop;
#[cfg(not(feature = "backend_wgpu"))]
pub use noop::*;

#[cfg(feature = "backend_wgpu")]
mod wgpu;

#[cfg(feature = "backend_wgpu")]
pub use self::wgpu::*;
