// kernel/src/graph.rs

//! Lifecycle ordering.
//!
//! A registration must come before every registration that (transitively)
//! requires it through its declared property injections. The sort is stable:
//! registrations with no relation keep their relative order.
//!
//! Cyclic graphs are tolerated. The number of moves is bounded, so a cycle
//! degrades the order instead of looping, and a warning names the cycle.

use crate::identity::Identity;
use crate::registration::Registration;

use std::collections::{HashMap, HashSet};

/// Orders `registrations` so dependencies precede their dependents.
pub fn sort(mut registrations: Vec<Registration>) -> Vec<Registration> {
  let edges: HashMap<Identity, Vec<Identity>> = registrations
    .iter()
    .map(|r| (r.identity.clone(), r.children.clone()))
    .collect();

  let len = registrations.len();
  let mut budget = len * len;
  let mut exhausted = false;
  let mut i = 0;
  while i < len {
    let needed = (i + 1..len).find(|&j| requires(&edges, &registrations[i].identity, &registrations[j].identity));
    match needed {
      Some(_) if budget == 0 => {
        exhausted = true;
        i += 1;
      }
      Some(j) => {
        let dependency = registrations.remove(j);
        registrations.insert(i, dependency);
        budget -= 1;
      }
      None => i += 1,
    }
  }

  if exhausted {
    let cycle = find_cycle(&edges)
      .map(|ids| ids.iter().map(Identity::as_str).collect::<Vec<_>>().join(" -> "))
      .unwrap_or_default();
    tracing::warn!(cycle = %cycle, "cyclic dependencies; lifecycle order is best-effort");
  }
  registrations
}

// Whether `from` reaches `to` through declared children.
fn requires(edges: &HashMap<Identity, Vec<Identity>>, from: &Identity, to: &Identity) -> bool {
  let mut seen = HashSet::new();
  let mut stack: Vec<&Identity> = edges.get(from).map(|c| c.iter().collect()).unwrap_or_default();
  while let Some(next) = stack.pop() {
    if next == to {
      return true;
    }
    if seen.insert(next) {
      if let Some(children) = edges.get(next) {
        stack.extend(children.iter());
      }
    }
  }
  false
}

/// Returns one dependency cycle among `edges`, closed on its first element.
pub fn find_cycle(edges: &HashMap<Identity, Vec<Identity>>) -> Option<Vec<Identity>> {
  let mut visited = HashSet::new();
  let mut on_path = HashSet::new();
  let mut path = Vec::new();

  let mut roots: Vec<&Identity> = edges.keys().collect();
  roots.sort();
  for root in roots {
    if !visited.contains(root) {
      if let Some(cycle) = visit(edges, root, &mut visited, &mut on_path, &mut path) {
        return Some(cycle);
      }
    }
  }
  None
}

fn visit<'a>(
  edges: &'a HashMap<Identity, Vec<Identity>>,
  node: &'a Identity,
  visited: &mut HashSet<&'a Identity>,
  on_path: &mut HashSet<&'a Identity>,
  path: &mut Vec<&'a Identity>,
) -> Option<Vec<Identity>> {
  visited.insert(node);
  on_path.insert(node);
  path.push(node);

  for next in edges.get(node).into_iter().flatten() {
    if on_path.contains(next) {
      let start = path.iter().position(|p| *p == next).unwrap_or(0);
      let mut cycle: Vec<Identity> = path[start..].iter().map(|p| (*p).clone()).collect();
      cycle.push(next.clone());
      return Some(cycle);
    }
    if !visited.contains(next) {
      if let Some(cycle) = visit(edges, next, visited, on_path, path) {
        return Some(cycle);
      }
    }
  }

  on_path.remove(node);
  path.pop();
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn reg(name: &str, children: &[&str]) -> Registration {
    Registration::new(
      Identity::new(name),
      Identity::new(name),
      true,
      children.iter().map(|c| Identity::new(*c)).collect(),
    )
  }

  fn names(regs: &[Registration]) -> Vec<&str> {
    regs.iter().map(|r| r.identity().as_str()).collect()
  }

  #[test]
  fn dependencies_come_first() {
    let sorted = sort(vec![reg("A", &["B"]), reg("B", &["C"]), reg("C", &[])]);
    assert_eq!(names(&sorted), vec!["C", "B", "A"]);
  }

  #[test]
  fn transitive_requirement_across_unrelated_entries() {
    let sorted = sort(vec![reg("A", &["B"]), reg("X", &[]), reg("C", &[]), reg("B", &["C"])]);
    assert_eq!(names(&sorted), vec!["C", "B", "A", "X"]);
  }

  #[test]
  fn unrelated_entries_keep_their_order() {
    let sorted = sort(vec![reg("Z", &[]), reg("Y", &[]), reg("X", &[])]);
    assert_eq!(names(&sorted), vec!["Z", "Y", "X"]);
  }

  #[test]
  fn unknown_children_are_ignored() {
    let sorted = sort(vec![reg("A", &["Ghost"]), reg("B", &[])]);
    assert_eq!(names(&sorted), vec!["A", "B"]);
  }

  #[test]
  fn cycles_terminate_with_every_entry_present() {
    let sorted = sort(vec![reg("A", &["B"]), reg("B", &["A"]), reg("C", &[])]);
    let mut got = names(&sorted);
    got.sort();
    assert_eq!(got, vec!["A", "B", "C"]);
  }

  #[test]
  fn find_cycle_reports_closed_path() {
    let edges: HashMap<Identity, Vec<Identity>> = [
      (Identity::new("A"), vec![Identity::new("B")]),
      (Identity::new("B"), vec![Identity::new("C")]),
      (Identity::new("C"), vec![Identity::new("A")]),
    ]
    .into_iter()
    .collect();
    let cycle = find_cycle(&edges).expect("cycle");
    assert_eq!(cycle.first(), cycle.last());
    assert_eq!(cycle.len(), 4);

    let acyclic: HashMap<Identity, Vec<Identity>> =
      [(Identity::new("A"), vec![Identity::new("B")]), (Identity::new("B"), vec![])]
        .into_iter()
        .collect();
    assert_eq!(find_cycle(&acyclic), None);
  }
}
