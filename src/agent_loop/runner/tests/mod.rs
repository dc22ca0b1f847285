mod support;

mod compaction;
