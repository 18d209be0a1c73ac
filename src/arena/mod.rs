// Arena-backed storage for the reactive graph.
//
// graph     - dep / link / subscriber slabs behind one lock, plus the
//             intrusive link-list operations and the global version
// tracking  - the thread's observing subscriber, run protocol, dirtiness
//             revalidation
// dep_map   - per-target dep tables and the track / trigger entry points

pub(crate) mod dep_map;
pub(crate) mod graph;
pub(crate) mod tracking;
