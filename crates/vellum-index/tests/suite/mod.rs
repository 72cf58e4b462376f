mod support;

mod bootstrap;
mod indexing_loop;
mod side_by_side;
