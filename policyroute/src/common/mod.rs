pub mod host_matcher;
