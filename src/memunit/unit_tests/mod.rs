#[cfg(test)]
mod support;

#[cfg(test)]
mod coherence_tests;
#[cfg(test)]
mod forwarding_tests;
#[cfg(test)]
mod mshr_tests;
#[cfg(test)]
mod speculation_tests;
