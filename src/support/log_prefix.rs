//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    component: String,
    user: Option<String>,
    task: Option<String>,
}

impl LogPrefix {
    pub fn new(component: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component,
                user: None,
                task: None,
            })),
        }
    }

    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner::clone(&inner))),
        }
    }

    /// Return a new, independent prefix for a sub-component.
    pub fn child(&self, component: &str) -> Self {
        let this = self.deep_clone();
        {
            let mut inner = this.inner.lock().unwrap();
            inner.component = format!("{}/{}", inner.component, component);
        }
        this
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(sanitise(user));
    }

    pub fn set_task(&self, task: String) {
        self.inner.lock().unwrap().task = Some(sanitise(task));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.component)?;
        if inner.user.is_some() || inner.task.is_some() {
            write!(f, "[")?;
            let mut first = true;
            if let Some(ref user) = inner.user {
                write!(f, "{user}")?;
                first = false;
            }

            if let Some(ref task) = inner.task {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "task={task}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formatting() {
        let prefix = LogPrefix::new("cstore".to_owned());
        assert_eq!("cstore", prefix.to_string());

        let child = prefix.child("repair");
        child.set_task("run\n1".to_owned());
        assert_eq!("cstore/repair[task=run1]", child.to_string());
        // The parent is unaffected by changes to the child
        assert_eq!("cstore", prefix.to_string());

        prefix.set_user("zim".to_owned());
        assert_eq!("cstore[zim]", prefix.to_string());
        prefix.set_task("x".repeat(100));
        assert_eq!(
            format!("cstore[zim task={}]", "x".repeat(64)),
            prefix.to_string(),
        );
    }
}
