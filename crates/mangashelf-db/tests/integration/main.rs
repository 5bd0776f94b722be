mod common;
mod job_queue_tests;
mod library_tests;
